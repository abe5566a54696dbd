//! Row descriptions and typed row access.

use std::collections::HashMap;
use std::sync::Arc;

use crate::convert::{FromSql, Registry};
use crate::error::{Error, Result};
use crate::protocol::backend::query::WireRowDescription;
use crate::protocol::types::{FormatCode, Oid, oid};

/// Immutable descriptor of one result column.
#[derive(Debug, Clone)]
pub struct Column {
    /// Zero-based position within the row
    pub index: usize,
    /// Column name as returned by the server, lower-cased for lookup
    pub name: String,
    /// OID of the source table (0 if not a table column)
    pub table_oid: Oid,
    /// Attribute number within the source table (0 if none)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (negative = variable length)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Wire format of the column data
    pub format: FormatCode,
}

impl Column {
    /// Descriptor for a column whose type the server never described.
    ///
    /// Used for index-based access on rows without metadata; the type
    /// is reported as `unknown` and the data as text format.
    pub(crate) fn unspecified(index: usize) -> Self {
        Self {
            index,
            name: String::new(),
            table_oid: 0,
            column_id: 0,
            type_oid: oid::UNKNOWN,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }
    }
}

/// Ordered set of column descriptors with a name → index map.
///
/// Column names need not be unique; lookup returns the first match.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
}

impl RowDescription {
    /// Build from a parsed wire-level RowDescription message.
    pub fn from_wire(wire: &WireRowDescription<'_>) -> Self {
        let mut columns = Vec::with_capacity(wire.len());
        let mut by_name = HashMap::with_capacity(wire.len());

        for (index, field) in wire.fields().iter().enumerate() {
            let name = field.name.to_lowercase();
            by_name.entry(name.clone()).or_insert(index);
            columns.push(Column {
                index,
                name,
                table_oid: field.table_oid(),
                column_id: field.column_id(),
                type_oid: field.type_oid(),
                type_size: field.type_size(),
                type_modifier: field.type_modifier(),
                format: field.format(),
            });
        }

        Self { columns, by_name }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column descriptors in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by position.
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Index of the first column with the given name (case-insensitive).
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.to_lowercase()).copied()
    }
}

/// One result row: raw field payloads plus a shared description.
///
/// Values are decoded lazily through the converter registry; the raw
/// bytes are kept exactly as the server sent them.
#[derive(Debug, Clone)]
pub struct Row {
    description: Option<Arc<RowDescription>>,
    raw: Vec<Option<Vec<u8>>>,
}

impl Row {
    /// Assemble a row from its description and raw field payloads.
    pub(crate) fn new(description: Option<Arc<RowDescription>>, raw: Vec<Option<Vec<u8>>>) -> Self {
        debug_assert!(
            description
                .as_ref()
                .is_none_or(|desc| desc.len() == raw.len())
        );
        Self { description, raw }
    }

    /// The row description, if the server sent one.
    pub fn description(&self) -> Option<&RowDescription> {
        self.description.as_deref()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Check if the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Raw payload of a field (`None` = SQL NULL).
    pub fn raw(&self, index: usize) -> Option<Option<&[u8]>> {
        self.raw.get(index).map(|field| field.as_deref())
    }

    /// Decode a field by position using the default registry.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T> {
        self.get_with(Registry::global(), index)
    }

    /// Decode a field by name using the default registry.
    ///
    /// Name lookup is case-insensitive and returns the first matching
    /// column.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T> {
        self.get_by_name_with(Registry::global(), name)
    }

    /// Decode a field by position using an explicit registry.
    pub fn get_with<T: FromSql>(&self, registry: &Registry, index: usize) -> Result<T> {
        let raw = self
            .raw
            .get(index)
            .ok_or_else(|| Error::ColumnNotPresent(index.to_string()))?
            .as_deref();

        // Rows from the simple protocol may arrive without metadata;
        // fall back to an unspecified descriptor for index access.
        let fallback;
        let column = match self.description.as_deref().and_then(|d| d.column(index)) {
            Some(column) => column,
            None => {
                fallback = Column::unspecified(index);
                &fallback
            }
        };

        let value = registry.decode(&T::type_ident(), column, raw)?;
        T::from_value(value)
    }

    /// Decode a field by name using an explicit registry.
    pub fn get_by_name_with<T: FromSql>(&self, registry: &Registry, name: &str) -> Result<T> {
        let description = self.description.as_deref().ok_or(Error::MissingRowMeta)?;
        let index = description
            .index_of(name)
            .ok_or_else(|| Error::ColumnNotPresent(name.to_string()))?;
        self.get_with(registry, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(names: &[&str], type_oid: Oid) -> Arc<RowDescription> {
        let mut columns = Vec::new();
        let mut by_name = HashMap::new();
        for (index, name) in names.iter().enumerate() {
            let name = name.to_lowercase();
            by_name.entry(name.clone()).or_insert(index);
            columns.push(Column {
                index,
                name,
                table_oid: 0,
                column_id: 0,
                type_oid,
                type_size: -1,
                type_modifier: -1,
                format: FormatCode::Text,
            });
        }
        Arc::new(RowDescription { columns, by_name })
    }

    #[test]
    fn name_lookup_is_case_insensitive_first_match() {
        let description = desc(&["ID", "id", "Name"], oid::INT4);
        assert_eq!(description.index_of("Id"), Some(0));
        assert_eq!(description.index_of("NAME"), Some(2));
        assert_eq!(description.index_of("missing"), None);
    }

    #[test]
    fn get_by_index_and_name() {
        let description = desc(&["id", "label"], oid::TEXT);
        let row = Row::new(
            Some(description),
            vec![Some(b"7".to_vec()), Some(b"seven".to_vec())],
        );

        let label: String = row.get_by_name("LABEL").unwrap();
        assert_eq!(label, "seven");
        let id: String = row.get(0).unwrap();
        assert_eq!(id, "7");
    }

    #[test]
    fn missing_metadata_errors_by_name_only() {
        let row = Row::new(None, vec![Some(b"42".to_vec())]);
        assert!(matches!(
            row.get_by_name::<String>("x"),
            Err(Error::MissingRowMeta)
        ));
        // Index access synthesizes an unspecified-type descriptor.
        let value: String = row.get(0).unwrap();
        assert_eq!(value, "42");
    }

    #[test]
    fn unknown_column_errors() {
        let description = desc(&["a"], oid::TEXT);
        let row = Row::new(Some(description), vec![None]);
        assert!(matches!(
            row.get_by_name::<String>("b"),
            Err(Error::ColumnNotPresent(_))
        ));
        assert!(matches!(
            row.get::<String>(3),
            Err(Error::ColumnNotPresent(_))
        ));
    }

    #[test]
    fn null_decodes_to_option_none() {
        let description = desc(&["a"], oid::INT4);
        let row = Row::new(Some(description), vec![None]);
        let value: Option<i32> = row.get(0).unwrap();
        assert_eq!(value, None);
    }
}
