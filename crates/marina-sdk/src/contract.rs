//! Ionio artifacts: JSON contract descriptions compiled into taproot script trees.

use std::collections::HashMap;

use lwk_wollet::elements::opcodes::{self, All as Opcode};
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::XOnlyPublicKey;
use lwk_wollet::elements::{Address, AddressParams, Script};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::taproot::TaprootSpend;

/// Type tag of constructor inputs that the wallet fills with its own key.
pub const XONLY_PUBKEY_TYPE: &str = "xonlypubkey";
/// Type tag of function inputs satisfied by a wallet signature.
pub const SIGNATURE_TYPE: &str = "sig";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFunction {
    pub name: String,
    #[serde(default)]
    pub function_inputs: Vec<Parameter>,
    pub asm: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    #[serde(default)]
    pub constructor_inputs: Vec<Parameter>,
    pub functions: Vec<ArtifactFunction>,
}

impl Artifact {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Artifact(format!("invalid artifact: {e}")))
    }
}

/// A constructor argument as it appears in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractArgument {
    Number(i64),
    Bool(bool),
    Text(String),
}

impl ContractArgument {
    fn as_hex_bytes(&self, param: &Parameter) -> Result<Vec<u8>> {
        match self {
            ContractArgument::Text(s) => hex::decode(s.trim_start_matches("0x")).map_err(|e| {
                Error::Artifact(format!("argument {} is not valid hex: {e}", param.name))
            }),
            other => Err(Error::Artifact(format!(
                "argument {} must be a hex string, got {other:?}",
                param.name
            ))),
        }
    }

    fn as_number(&self, param: &Parameter) -> Result<i64> {
        match self {
            ContractArgument::Number(n) => Ok(*n),
            ContractArgument::Text(s) => s
                .parse()
                .map_err(|e| Error::Artifact(format!("argument {} is not a number: {e}", param.name))),
            ContractArgument::Bool(_) => Err(Error::Artifact(format!(
                "argument {} must be a number",
                param.name
            ))),
        }
    }

    fn push_onto(&self, builder: Builder, param: &Parameter) -> Result<Builder> {
        Ok(match param.kind.as_str() {
            "bool" => match self {
                ContractArgument::Bool(b) => builder.push_int(i64::from(*b)),
                _ => {
                    return Err(Error::Artifact(format!(
                        "argument {} must be a bool",
                        param.name
                    )));
                }
            },
            "number" | "int" => builder.push_int(self.as_number(param)?),
            "value" => {
                let value = u64::try_from(self.as_number(param)?).map_err(|_| {
                    Error::Artifact(format!("argument {} must be non-negative", param.name))
                })?;
                builder.push_slice(&value.to_le_bytes())
            }
            _ => builder.push_slice(&self.as_hex_bytes(param)?),
        })
    }
}

/// Look up an opcode by its assembly mnemonic (`OP_CHECKSIG`, `OP_1`, ...).
fn opcode_by_name(name: &str) -> Option<Opcode> {
    match name {
        "OP_0" | "OP_FALSE" => return Some(opcodes::all::OP_PUSHBYTES_0),
        "OP_TRUE" => return Some(opcodes::all::OP_PUSHNUM_1),
        "OP_1NEGATE" => return Some(opcodes::all::OP_PUSHNUM_NEG1),
        _ => {}
    }
    if let Some(n) = name.strip_prefix("OP_").and_then(|n| n.parse::<u8>().ok()) {
        return (1..=16).contains(&n).then(|| Opcode::from(0x50 + n));
    }
    (0..=u8::MAX)
        .map(Opcode::from)
        .find(|op| format!("{op:?}") == name)
}

/// Compile one function's assembly with `args` bound to the constructor inputs.
pub fn compile_function(
    function: &ArtifactFunction,
    constructor_inputs: &[Parameter],
    args: &[ContractArgument],
) -> Result<Script> {
    let mut builder = Builder::new();
    for token in &function.asm {
        if let Some(name) = token.strip_prefix('$') {
            let pos = constructor_inputs
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| Error::Artifact(format!("unknown constructor input ${name}")))?;
            let arg = args
                .get(pos)
                .ok_or_else(|| Error::Artifact(format!("missing argument for ${name}")))?;
            builder = arg.push_onto(builder, &constructor_inputs[pos])?;
        } else if token.starts_with("OP_") {
            let op = opcode_by_name(token)
                .ok_or_else(|| Error::Artifact(format!("unknown opcode {token}")))?;
            builder = builder.push_opcode(op);
        } else {
            let data = hex::decode(token.trim_start_matches("0x"))
                .map_err(|e| Error::Artifact(format!("bad asm token {token}: {e}")))?;
            builder = builder.push_slice(&data);
        }
    }
    Ok(builder.into_script())
}

/// A compiled leaf, remembering which artifact function produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractLeaf {
    pub function: ArtifactFunction,
    pub script: Script,
}

impl ContractLeaf {
    /// True when every function input is a wallet signature.
    pub fn only_signature_inputs(&self) -> bool {
        self.function
            .function_inputs
            .iter()
            .all(|input| input.kind == SIGNATURE_TYPE)
    }
}

/// An artifact bound to constructor arguments.
#[derive(Debug, Clone)]
pub struct Contract {
    artifact: Artifact,
    arguments: Vec<ContractArgument>,
    leaves: Vec<ContractLeaf>,
    spend: TaprootSpend,
}

impl Contract {
    /// Compile `artifact` with positional `arguments` under the NUMS internal key.
    pub fn new(artifact: Artifact, arguments: Vec<ContractArgument>) -> Result<Self> {
        if arguments.len() != artifact.constructor_inputs.len() {
            return Err(Error::Artifact(format!(
                "{} expects {} constructor arguments, got {}",
                artifact.contract_name,
                artifact.constructor_inputs.len(),
                arguments.len()
            )));
        }

        let leaves = artifact
            .functions
            .iter()
            .map(|f| {
                Ok(ContractLeaf {
                    function: f.clone(),
                    script: compile_function(f, &artifact.constructor_inputs, &arguments)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if leaves.is_empty() {
            return Err(Error::Artifact(format!(
                "{} has no functions",
                artifact.contract_name
            )));
        }
        let spend = TaprootSpend::with_nums(leaves.iter().map(|l| l.script.clone()).collect())?;

        Ok(Self {
            artifact,
            arguments,
            leaves,
            spend,
        })
    }

    /// Bind named arguments, filling absent `xonlypubkey` inputs with `wallet_key`.
    pub fn with_named_arguments(
        artifact: Artifact,
        named: &HashMap<String, ContractArgument>,
        wallet_key: &XOnlyPublicKey,
    ) -> Result<Self> {
        let arguments = artifact
            .constructor_inputs
            .iter()
            .map(|param| match named.get(&param.name) {
                Some(arg) => Ok(arg.clone()),
                None if param.kind == XONLY_PUBKEY_TYPE => {
                    Ok(ContractArgument::Text(hex::encode(wallet_key.serialize())))
                }
                None => Err(Error::Artifact(format!(
                    "missing constructor argument {}",
                    param.name
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(artifact, arguments)
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn arguments(&self) -> &[ContractArgument] {
        &self.arguments
    }

    pub fn leaves(&self) -> &[ContractLeaf] {
        &self.leaves
    }

    pub fn leaf(&self, script: &Script) -> Option<&ContractLeaf> {
        self.leaves.iter().find(|l| &l.script == script)
    }

    pub fn taproot(&self) -> &TaprootSpend {
        &self.spend
    }

    pub fn script_pubkey(&self) -> Script {
        self.spend.script_pubkey()
    }

    pub fn address(
        &self,
        blinder: Option<lwk_wollet::elements::secp256k1_zkp::PublicKey>,
        params: &'static AddressParams,
    ) -> Result<Address> {
        Address::from_script(&self.script_pubkey(), blinder, params)
            .ok_or_else(|| Error::InvalidAddress("taproot script has no address form".into()))
    }
}
