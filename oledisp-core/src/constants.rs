//! Layered table of named constants contributed by type libraries.
//!
//! Each loaded library adds one table; a lookup walks the tables in the order
//! they were added and returns the first hit.  Names are case-sensitive, as
//! enum members in generated bindings are.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::DispatchError;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct Constants {
    tables: RwLock<Vec<HashMap<String, Value>>>,
}

impl Constants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, table: HashMap<String, Value>) {
        self.tables.write().push(table);
    }

    /// Look a constant up; unknown names are `MemberNotFound` so attribute
    /// style callers can report "no such attribute".
    pub fn get(&self, name: &str) -> Result<Value, DispatchError> {
        self.tables
            .read()
            .iter()
            .find_map(|t| t.get(name).cloned())
            .ok_or_else(|| DispatchError::MemberNotFound(name.into()))
    }

    pub fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_table_wins() {
        let c = Constants::new();
        c.add_table(HashMap::from([("olFolderInbox".to_owned(), Value::Int(6))]));
        c.add_table(HashMap::from([
            ("olFolderInbox".to_owned(), Value::Int(99)),
            ("xlAll".to_owned(), Value::Int(-4104)),
        ]));
        assert_eq!(c.get("olFolderInbox").unwrap(), Value::Int(6));
        assert_eq!(c.get("xlAll").unwrap(), Value::Int(-4104));
        assert_eq!(c.table_count(), 2);
    }

    #[test]
    fn test_unknown_constant_is_member_not_found() {
        let c = Constants::new();
        assert!(c.get("nothing").unwrap_err().is_member_not_found());
    }
}
