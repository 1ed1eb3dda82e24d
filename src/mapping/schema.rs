// Schema export - CREATE TABLE statements for every mapped table and join table

use std::collections::BTreeMap;

use crate::error::AppResult;
use crate::mapping::metadata::{CollectionKind, IdStrategy, PropertyKind};
use crate::mapping::metamodel::Metamodel;

struct TableDefinition {
    columns: Vec<String>,
    constraints: Vec<String>,
}

/// DDL for the whole metamodel, tables first, join tables last
pub fn create_statements(model: &Metamodel) -> AppResult<Vec<String>> {
    let mut tables: BTreeMap<String, TableDefinition> = BTreeMap::new();
    let mut order = Vec::new();
    let mut join_tables = Vec::new();

    for meta in model.iter() {
        let id_column = match meta.id.strategy {
            IdStrategy::Identity => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", meta.id.column),
            _ => format!("{} {} PRIMARY KEY", meta.id.column, meta.id.sql_type.ddl()),
        };
        let mut definition = TableDefinition {
            columns: vec![id_column],
            constraints: Vec::new(),
        };

        for (_, property) in meta.column_properties() {
            let Some(column) = &property.column else {
                continue;
            };
            let null = if property.nullable { "" } else { " NOT NULL" };
            match &property.kind {
                PropertyKind::Basic(sql_type) => {
                    definition
                        .columns
                        .push(format!("{} {}{}", column, sql_type.ddl(), null));
                }
                PropertyKind::ManyToOne { target, .. } => {
                    let target_meta = model.metadata(target)?;
                    definition.columns.push(format!(
                        "{} {}{}",
                        column,
                        target_meta.id.sql_type.ddl(),
                        null
                    ));
                    definition.constraints.push(format!(
                        "FOREIGN KEY ({}) REFERENCES {}({})",
                        column, target_meta.table, target_meta.id.column
                    ));
                }
                PropertyKind::Collection(_) => {}
            }
        }

        order.push(meta.table.clone());
        tables.insert(meta.table.clone(), definition);
    }

    // Key columns of unidirectional one-to-many collections live in the element table
    for meta in model.iter() {
        for (_, mapping) in meta.collections() {
            let target_meta = model.metadata(&mapping.target)?;
            match &mapping.kind {
                CollectionKind::OneToMany { key_column, .. } => {
                    if let Some(definition) = tables.get_mut(&target_meta.table) {
                        let exists = definition
                            .columns
                            .iter()
                            .any(|c| c.split_whitespace().next() == Some(key_column.as_str()));
                        if !exists {
                            definition.columns.push(format!(
                                "{} {}",
                                key_column,
                                meta.id.sql_type.ddl()
                            ));
                            definition.constraints.push(format!(
                                "FOREIGN KEY ({}) REFERENCES {}({})",
                                key_column, meta.table, meta.id.column
                            ));
                        }
                    }
                }
                CollectionKind::ManyToMany {
                    join_table,
                    key_column,
                    element_column,
                } => {
                    join_tables.push(format!(
                        "CREATE TABLE IF NOT EXISTS {join} ({key} {key_type} NOT NULL, {element} {element_type} NOT NULL, PRIMARY KEY ({key}, {element}), FOREIGN KEY ({key}) REFERENCES {owner}({owner_id}), FOREIGN KEY ({element}) REFERENCES {target}({target_id}))",
                        join = join_table,
                        key = key_column,
                        key_type = meta.id.sql_type.ddl(),
                        element = element_column,
                        element_type = target_meta.id.sql_type.ddl(),
                        owner = meta.table,
                        owner_id = meta.id.column,
                        target = target_meta.table,
                        target_id = target_meta.id.column,
                    ));
                }
            }
        }
    }

    let mut statements = Vec::new();
    for table in order {
        if let Some(definition) = tables.remove(&table) {
            let mut parts = definition.columns;
            parts.extend(definition.constraints);
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                table,
                parts.join(", ")
            ));
        }
    }
    statements.extend(join_tables);
    Ok(statements)
}

/// DROP statements in reverse dependency order
pub fn drop_statements(model: &Metamodel) -> Vec<String> {
    let mut statements = Vec::new();
    for meta in model.iter() {
        for (_, mapping) in meta.collections() {
            if let CollectionKind::ManyToMany { join_table, .. } = &mapping.kind {
                statements.push(format!("DROP TABLE IF EXISTS {}", join_table));
            }
        }
    }
    let tables: Vec<String> = model.iter().map(|m| m.table.clone()).collect();
    for table in tables.into_iter().rev() {
        statements.push(format!("DROP TABLE IF EXISTS {}", table));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::library;

    #[test]
    fn test_library_schema() {
        let model = library::library_metamodel().unwrap();
        let ddl = create_statements(&model).unwrap();

        let authors = ddl.iter().find(|s| s.contains("TABLE IF NOT EXISTS authors")).unwrap();
        assert!(authors.contains("name TEXT NOT NULL"));
        assert!(authors.contains("version INTEGER NOT NULL"));

        let books = ddl.iter().find(|s| s.contains("TABLE IF NOT EXISTS books")).unwrap();
        assert!(books.contains("author_id INTEGER"));
        assert!(books.contains("FOREIGN KEY (author_id) REFERENCES authors(id)"));
        // the inverse collection reuses the many-to-one column
        assert_eq!(books.matches("author_id INTEGER").count(), 1);

        let join = ddl.last().unwrap();
        assert!(join.contains("book_tags"));
        assert!(join.contains("PRIMARY KEY (book_id, tag_id)"));
    }

    #[test]
    fn test_drop_order() {
        let model = library::library_metamodel().unwrap();
        let drops = drop_statements(&model);
        assert_eq!(drops[0], "DROP TABLE IF EXISTS book_tags");
        assert_eq!(drops.last().unwrap(), "DROP TABLE IF EXISTS authors");
    }
}
