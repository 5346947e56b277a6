//! Electrum subscription relay for wallet scripts.
//!
//! A dedicated OS thread holds one Electrum connection, subscribes every
//! watched script and forwards status changes and new tips as
//! [`ChainEvent`]s. Lost connections are retried with exponential backoff,
//! after which every watched script is subscribed again.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use electrum_client::{Client, ConfigBuilder, ElectrumApi, Param};
use lwk_wollet::bitcoin::ScriptBuf;
use lwk_wollet::elements::Script;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};

#[derive(Debug)]
enum Command {
    Watch(Script),
    Unwatch(Script),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The Electrum status of a watched script changed.
    ScriptActivity { script: Script, status: String },
    NewTip { height: u32 },
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone)]
pub struct ChainWatcherConfig {
    pub electrum_url: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl ChainWatcherConfig {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Cloneable control side of a running watcher. Dropping every handle stops
/// the thread.
#[derive(Clone)]
pub struct ChainWatcherHandle {
    commands: UnboundedSender<Command>,
}

impl ChainWatcherHandle {
    pub fn watch(&self, script: Script) {
        let _ = self.commands.send(Command::Watch(script));
    }

    pub fn unwatch(&self, script: Script) {
        let _ = self.commands.send(Command::Unwatch(script));
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

pub fn spawn_chain_watcher(
    config: ChainWatcherConfig,
) -> Result<(ChainWatcherHandle, UnboundedReceiver<ChainEvent>)> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let watcher = Watcher::new(config, command_rx, event_tx);
    thread::Builder::new()
        .name("chain-watcher".into())
        .spawn(move || watcher.run())
        .map_err(|e| Error::Chain(format!("cannot spawn chain watcher: {e}")))?;

    Ok((
        ChainWatcherHandle {
            commands: command_tx,
        },
        event_rx,
    ))
}

fn electrum_script(script: &Script) -> ScriptBuf {
    ScriptBuf::from(script.to_bytes())
}

fn script_hex(script: &Script) -> String {
    hex::encode(script.as_bytes())
}

struct Watcher {
    config: ChainWatcherConfig,
    commands: UnboundedReceiver<Command>,
    events: UnboundedSender<ChainEvent>,
    scripts: HashSet<Script>,
    tip: Option<u32>,
}

impl Watcher {
    fn new(
        config: ChainWatcherConfig,
        commands: UnboundedReceiver<Command>,
        events: UnboundedSender<ChainEvent>,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            scripts: HashSet::new(),
            tip: None,
        }
    }

    fn emit(&self, event: ChainEvent) {
        let _ = self.events.send(event);
    }

    fn run(mut self) {
        let Some(mut client) = self.connect() else {
            return;
        };
        log::info!("chain_watcher: connected to {}", self.config.electrum_url);

        loop {
            if !self.drain_commands(Some(&client)) {
                return;
            }
            // A ping also flushes notifications the server queued for us.
            if client.raw_call("server.ping", Vec::<Param>::new()).is_err() {
                log::warn!("chain_watcher: connection lost");
                self.emit(ChainEvent::Disconnected);
                client = match self.connect() {
                    Some(c) => c,
                    None => return,
                };
                self.emit(ChainEvent::Reconnected);
                log::info!("chain_watcher: reconnected");
                continue;
            }
            self.poll(&client);
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Apply queued commands. `false` once the watcher must stop.
    fn drain_commands(&mut self, client: Option<&Client>) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Watch(script)) => {
                    if let Some(client) = client {
                        self.subscribe(client, &script);
                    }
                    // Kept even if the subscription failed; reconnect retries it.
                    self.scripts.insert(script);
                }
                Ok(Command::Unwatch(script)) => {
                    if let Some(client) = client {
                        let _ = client.script_unsubscribe(&electrum_script(&script));
                    }
                    self.scripts.remove(&script);
                }
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => {
                    log::info!("chain_watcher: stopping");
                    return false;
                }
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn subscribe(&self, client: &Client, script: &Script) {
        if let Err(e) = client.script_subscribe(&electrum_script(script)) {
            log::warn!("chain_watcher: subscribe {} failed: {e}", script_hex(script));
        }
    }

    /// Connect with exponential backoff, then subscribe the tip and every
    /// watched script. `None` when stopped while offline.
    fn connect(&mut self) -> Option<Client> {
        let mut backoff = Duration::from_secs(1).min(self.config.max_backoff);
        let timeout = self.config.request_timeout.as_secs().clamp(1, u8::MAX as u64) as u8;
        loop {
            let electrum_config = ConfigBuilder::new().timeout(Some(timeout)).build();
            match Client::from_config(&self.config.electrum_url, electrum_config) {
                Ok(client) => {
                    // Liquid headers do not parse as Bitcoin headers.
                    if let Err(e) = client.block_headers_subscribe_raw() {
                        log::warn!("chain_watcher: tip subscription failed: {e}");
                    }
                    for script in &self.scripts {
                        self.subscribe(&client, script);
                    }
                    return Some(client);
                }
                Err(e) => {
                    log::warn!("chain_watcher: connect failed ({e}), retrying in {backoff:?}");
                    self.emit(ChainEvent::Disconnected);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    if !self.drain_commands(None) {
                        return None;
                    }
                }
            }
        }
    }

    fn poll(&mut self, client: &Client) {
        if let Ok(Some(header)) = client.block_headers_pop_raw() {
            let height = header.height as u32;
            if self.tip.is_none_or(|tip| height > tip) {
                self.tip = Some(height);
                self.emit(ChainEvent::NewTip { height });
            }
        }

        for script in &self.scripts {
            match client.script_pop(&electrum_script(script)) {
                Ok(Some(status)) => {
                    log::debug!("chain_watcher: activity on {}", script_hex(script));
                    self.emit(ChainEvent::ScriptActivity {
                        script: script.clone(),
                        status: hex::encode(*status),
                    });
                }
                Ok(None) => {}
                Err(e) => log::warn!("chain_watcher: poll {} failed: {e}", script_hex(script)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_watcher(
        max_backoff: Duration,
    ) -> (
        Watcher,
        UnboundedSender<Command>,
        UnboundedReceiver<ChainEvent>,
    ) {
        let config = ChainWatcherConfig {
            electrum_url: "tcp://127.0.0.1:1".into(),
            poll_interval: Duration::from_millis(10),
            max_backoff,
            request_timeout: Duration::from_secs(1),
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Watcher::new(config, command_rx, event_tx),
            command_tx,
            event_rx,
        )
    }

    #[test]
    fn default_intervals() {
        let cfg = ChainWatcherConfig::new("tcp://localhost:50001");
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_backoff, Duration::from_secs(60));
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn offline_commands_track_scripts() {
        let (mut watcher, commands, _events) = offline_watcher(Duration::from_millis(10));
        let script = Script::from(vec![0x51]);
        commands.send(Command::Watch(script.clone())).unwrap();
        assert!(watcher.drain_commands(None));
        assert!(watcher.scripts.contains(&script));

        commands.send(Command::Unwatch(script)).unwrap();
        commands.send(Command::Stop).unwrap();
        assert!(!watcher.drain_commands(None));
        assert!(watcher.scripts.is_empty());
    }

    #[test]
    fn dropped_handles_stop_the_watcher() {
        let (mut watcher, commands, _events) = offline_watcher(Duration::from_millis(10));
        drop(commands);
        assert!(!watcher.drain_commands(None));
    }

    #[test]
    fn stop_while_offline_gives_up_connecting() {
        let (mut watcher, commands, mut events) = offline_watcher(Duration::from_millis(10));
        commands.send(Command::Stop).unwrap();
        assert!(watcher.connect().is_none());
        assert_eq!(events.try_recv().unwrap(), ChainEvent::Disconnected);
    }
}
