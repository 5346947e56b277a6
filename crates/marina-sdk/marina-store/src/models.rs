use diesel::prelude::*;

use crate::schema::kv_entries;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = kv_entries)]
pub struct EntryRow {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = kv_entries)]
pub struct NewEntryRow<'a> {
    pub key: &'a str,
    pub value: &'a str,
}
