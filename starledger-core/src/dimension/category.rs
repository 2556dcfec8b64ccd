//! Category dimension: unique names, mutable description.

use std::collections::HashMap;
use std::sync::RwLock;

use super::DimensionError;
use crate::domain::{Category, SurrogateKey};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Category>,
    by_name: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct CategoryDimension {
    table: RwLock<Table>,
}

impl CategoryDimension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows. Keys must be dense from 1 and names
    /// unique.
    pub fn from_rows(mut rows: Vec<Category>) -> Result<Self, DimensionError> {
        rows.sort_by_key(|c| c.key);
        let mut table = Table::default();
        for (i, row) in rows.into_iter().enumerate() {
            if row.key.0 != i as u64 + 1 {
                return Err(DimensionError::Corrupt(format!(
                    "category keys not dense at {}",
                    row.key
                )));
            }
            if table.by_name.insert(row.name.clone(), i).is_some() {
                return Err(DimensionError::Corrupt(format!(
                    "duplicate category '{}'",
                    row.name
                )));
            }
            table.rows.push(row);
        }
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    /// Surrogate key for `name`, inserting it if absent. Two callers racing on
    /// the same new name both get the single winning row.
    pub fn resolve(&self, name: &str) -> SurrogateKey {
        if let Some(key) = self.key_of(name) {
            return key;
        }
        let mut table = self.table.write().unwrap();
        if let Some(&idx) = table.by_name.get(name) {
            return table.rows[idx].key;
        }
        let idx = table.rows.len();
        let key = SurrogateKey(idx as u64 + 1);
        table.rows.push(Category {
            key,
            name: name.to_string(),
            description: None,
        });
        table.by_name.insert(name.to_string(), idx);
        tracing::debug!(category = name, key = key.0, "created category");
        key
    }

    /// Key of an existing category, without inserting.
    pub fn key_of(&self, name: &str) -> Option<SurrogateKey> {
        let table = self.table.read().unwrap();
        table.by_name.get(name).map(|&i| table.rows[i].key)
    }

    /// Row for `key`. Keys are assigned densely from 1 in insertion order.
    pub fn get(&self, key: SurrogateKey) -> Option<Category> {
        let table = self.table.read().unwrap();
        key.0
            .checked_sub(1)
            .and_then(|i| table.rows.get(i as usize))
            .cloned()
    }

    /// Update the descriptive text, creating the category if needed.
    pub fn set_description(&self, name: &str, description: &str) -> SurrogateKey {
        let key = self.resolve(name);
        let mut table = self.table.write().unwrap();
        if let Some(row) = table.rows.get_mut(key.0 as usize - 1) {
            row.description = Some(description.to_string());
        }
        key
    }

    /// Every category, ordered by key.
    pub fn rows(&self) -> Vec<Category> {
        self.table.read().unwrap().rows.clone()
    }

    /// Swap in the contents of `other`, as reloaded from disk.
    pub fn replace_with(&self, other: CategoryDimension) {
        *self.table.write().unwrap() = other.table.into_inner().unwrap();
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
