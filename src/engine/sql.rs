// SQL generation - statements issued by the engine for entities and collections

use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::{Identifier, Value};
use crate::error::{AppError, AppResult};
use crate::infrastructure::{SqlValue, Statement};
use crate::mapping::{
    CollectionKind, CollectionMapping, EntityMetadata, EntityState, IdStrategy, SqlType,
};

pub fn identifier_param(id: &Identifier) -> SqlValue {
    match id {
        Identifier::Integer(v) => SqlValue::Integer(*v),
        Identifier::Text(v) => SqlValue::Text(v.clone()),
    }
}

pub fn identifier_from(value: &SqlValue) -> AppResult<Identifier> {
    match value {
        SqlValue::Integer(v) => Ok(Identifier::Integer(*v)),
        SqlValue::Text(v) => Ok(Identifier::Text(v.clone())),
        other => Err(AppError::MappingError(format!(
            "Cannot use {:?} as an identifier",
            other
        ))),
    }
}

/// Parameter for a property value; references bind the target's identifier
pub fn to_sql_value(value: &Value) -> AppResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(v) => SqlValue::Integer(i64::from(*v)),
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
        Value::Timestamp(v) => SqlValue::Text(format_timestamp(v)),
        Value::Reference(link) => {
            let id = link.identifier().ok_or_else(|| {
                AppError::TransientObject(format!("{:?} has no identifier", link))
            })?;
            identifier_param(&id)
        }
        Value::Collection(_) => {
            return Err(AppError::MappingError(
                "Collections are not stored in a column".to_string(),
            ))
        }
    })
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(text: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::MappingError(format!("Invalid timestamp '{}': {}", text, e)))
}

/// Convert a column read back from the database into a property value
pub fn column_value(sql_type: SqlType, value: &SqlValue) -> AppResult<Value> {
    let mismatch = || {
        AppError::MappingError(format!("Column value {:?} does not fit {:?}", value, sql_type))
    };
    Ok(match (sql_type, value) {
        (_, SqlValue::Null) => Value::Null,
        (SqlType::Boolean, SqlValue::Integer(v)) => Value::Boolean(*v != 0),
        (SqlType::Integer, SqlValue::Integer(v)) => Value::Integer(*v),
        (SqlType::Real, SqlValue::Real(v)) => Value::Real(*v),
        (SqlType::Real, SqlValue::Integer(v)) => Value::Real(*v as f64),
        (SqlType::Text, SqlValue::Text(v)) => Value::Text(v.clone()),
        (SqlType::Blob, SqlValue::Blob(v)) => Value::Blob(v.clone()),
        (SqlType::Timestamp, SqlValue::Text(v)) => Value::Timestamp(parse_timestamp(v)?),
        _ => return Err(mismatch()),
    })
}

/// Id column followed by every column property, in mapping order
pub fn select_columns(meta: &EntityMetadata) -> String {
    std::iter::once(meta.id.column.as_str())
        .chain(meta.column_properties().filter_map(|(_, p)| p.column.as_deref()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn select_by_id(meta: &EntityMetadata, id: &Identifier) -> Statement {
    Statement::new(
        format!(
            "SELECT {} FROM {} WHERE {} = ?",
            select_columns(meta),
            meta.table,
            meta.id.column
        ),
        &meta.table,
    )
    .bind(identifier_param(id))
}

pub fn exists(meta: &EntityMetadata, id: &Identifier) -> Statement {
    Statement::new(
        format!("SELECT 1 FROM {} WHERE {} = ?", meta.table, meta.id.column),
        &meta.table,
    )
    .bind(identifier_param(id))
}

pub fn max_id(meta: &EntityMetadata) -> Statement {
    Statement::new(
        format!("SELECT MAX({}) FROM {}", meta.id.column, meta.table),
        &meta.table,
    )
}

/// Current version column of a row
pub fn select_version(meta: &EntityMetadata, id: &Identifier) -> AppResult<Statement> {
    let column = version_column(meta)?;
    Ok(Statement::new(
        format!("SELECT {} FROM {} WHERE {} = ?", column, meta.table, meta.id.column),
        &meta.table,
    )
    .bind(identifier_param(id)))
}

fn version_column(meta: &EntityMetadata) -> AppResult<&str> {
    meta.version
        .and_then(|i| meta.properties[i].column.as_deref())
        .ok_or_else(|| AppError::MappingError(format!("Entity '{}' is not versioned", meta.name)))
}

/// INSERT of the insertable columns; identity ids are left to the database
pub fn insert(meta: &EntityMetadata, id: Option<&Identifier>, state: &EntityState) -> AppResult<Statement> {
    let mut columns = Vec::new();
    let mut params = Vec::new();

    if meta.id.strategy != IdStrategy::Identity {
        let id = id.ok_or_else(|| {
            AppError::IdGenerationError(format!("No identifier for new '{}'", meta.name))
        })?;
        columns.push(meta.id.column.as_str());
        params.push(identifier_param(id));
    }

    for (index, property) in meta.column_properties() {
        if !property.insertable {
            continue;
        }
        if let Some(column) = property.column.as_deref() {
            columns.push(column);
            params.push(to_sql_value(state.get(index))?);
        }
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", meta.table)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            meta.table,
            columns.join(", "),
            placeholders
        )
    };

    Ok(params
        .into_iter()
        .fold(Statement::new(sql, &meta.table), Statement::bind))
}

/// UPDATE guarded by the previous version for versioned entities.
/// Returns None when no column needs writing.
pub fn update(
    meta: &EntityMetadata,
    id: &Identifier,
    state: &EntityState,
    dirty: &[usize],
    previous_version: Option<i64>,
) -> AppResult<Option<Statement>> {
    let mut assignments = Vec::new();
    let mut params = Vec::new();

    for (index, property) in meta.column_properties() {
        let is_version = Some(index) == meta.version;
        if !property.updatable && !is_version {
            continue;
        }
        if meta.dynamic_update && !dirty.contains(&index) && !is_version {
            continue;
        }
        if let Some(column) = property.column.as_deref() {
            assignments.push(format!("{} = ?", column));
            params.push(to_sql_value(state.get(index))?);
        }
    }

    if assignments.is_empty() {
        return Ok(None);
    }

    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        meta.table,
        assignments.join(", "),
        meta.id.column
    );
    params.push(identifier_param(id));

    if let Some(version) = previous_version {
        sql.push_str(&format!(" AND {} = ?", version_column(meta)?));
        params.push(SqlValue::Integer(version));
    }

    Ok(Some(
        params
            .into_iter()
            .fold(Statement::new(sql, &meta.table), Statement::bind),
    ))
}

pub fn delete(meta: &EntityMetadata, id: &Identifier, version: Option<i64>) -> AppResult<Statement> {
    let mut statement = Statement::new(
        format!("DELETE FROM {} WHERE {} = ?", meta.table, meta.id.column),
        &meta.table,
    )
    .bind(identifier_param(id));
    if let Some(version) = version {
        statement.sql.push_str(&format!(" AND {} = ?", version_column(meta)?));
        statement = statement.bind(SqlValue::Integer(version));
    }
    Ok(statement)
}

/// Identifiers of the elements of a collection, in element id order
pub fn select_element_ids(
    mapping: &CollectionMapping,
    target: &EntityMetadata,
    owner_id: &Identifier,
) -> Statement {
    let sql = match &mapping.kind {
        CollectionKind::OneToMany { key_column, .. } => format!(
            "SELECT {id} FROM {table} WHERE {key} = ? ORDER BY {id}",
            id = target.id.column,
            table = target.table,
            key = key_column
        ),
        CollectionKind::ManyToMany {
            join_table,
            key_column,
            element_column,
        } => format!(
            "SELECT {element} FROM {join} WHERE {key} = ? ORDER BY {element}",
            element = element_column,
            join = join_table,
            key = key_column
        ),
    };
    Statement::new(sql, mapping.query_space(&target.table)).bind(identifier_param(owner_id))
}

/// Link one element to its owner
pub fn insert_element(
    mapping: &CollectionMapping,
    target: &EntityMetadata,
    owner_id: &Identifier,
    element_id: &Identifier,
) -> Statement {
    match &mapping.kind {
        CollectionKind::OneToMany { key_column, .. } => Statement::new(
            format!(
                "UPDATE {} SET {} = ? WHERE {} = ?",
                target.table, key_column, target.id.column
            ),
            &target.table,
        )
        .bind(identifier_param(owner_id))
        .bind(identifier_param(element_id)),
        CollectionKind::ManyToMany {
            join_table,
            key_column,
            element_column,
        } => Statement::new(
            format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                join_table, key_column, element_column
            ),
            join_table,
        )
        .bind(identifier_param(owner_id))
        .bind(identifier_param(element_id)),
    }
}

/// Unlink one element from its owner
pub fn delete_element(
    mapping: &CollectionMapping,
    target: &EntityMetadata,
    owner_id: &Identifier,
    element_id: &Identifier,
) -> Statement {
    match &mapping.kind {
        CollectionKind::OneToMany { key_column, .. } => Statement::new(
            format!(
                "UPDATE {table} SET {key} = NULL WHERE {id} = ? AND {key} = ?",
                table = target.table,
                key = key_column,
                id = target.id.column
            ),
            &target.table,
        )
        .bind(identifier_param(element_id))
        .bind(identifier_param(owner_id)),
        CollectionKind::ManyToMany {
            join_table,
            key_column,
            element_column,
        } => Statement::new(
            format!(
                "DELETE FROM {} WHERE {} = ? AND {} = ?",
                join_table, key_column, element_column
            ),
            join_table,
        )
        .bind(identifier_param(owner_id))
        .bind(identifier_param(element_id)),
    }
}

/// Unlink every element of a collection
pub fn delete_all_elements(
    mapping: &CollectionMapping,
    target: &EntityMetadata,
    owner_id: &Identifier,
) -> Statement {
    match &mapping.kind {
        CollectionKind::OneToMany { key_column, .. } => Statement::new(
            format!(
                "UPDATE {table} SET {key} = NULL WHERE {key} = ?",
                table = target.table,
                key = key_column
            ),
            &target.table,
        )
        .bind(identifier_param(owner_id)),
        CollectionKind::ManyToMany {
            join_table,
            key_column,
            ..
        } => Statement::new(
            format!("DELETE FROM {} WHERE {} = ?", join_table, key_column),
            join_table,
        )
        .bind(identifier_param(owner_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::library::{self, Author, Book};
    use crate::mapping::EntityRef;

    #[test]
    fn test_insert_binds_reference_identifier() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Book").unwrap();
        let author = EntityRef::new(Author::new("Herbert"));
        author.write().id = Some(4);
        let book = EntityRef::new(Book::new("Dune", Some(&author)));

        let stmt = insert(&meta, Some(&Identifier::Integer(99)), &book.link().state()).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO books (id, title, pages, author_id) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(stmt.params[0], SqlValue::Integer(99));
        assert_eq!(stmt.params[3], SqlValue::Integer(4));
    }

    #[test]
    fn test_insert_rejects_unsaved_reference() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Book").unwrap();
        let author = EntityRef::new(Author::new("Nobody"));
        let book = EntityRef::new(Book::new("Draft", Some(&author)));
        let err = insert(&meta, Some(&Identifier::Integer(1)), &book.link().state()).unwrap_err();
        assert!(matches!(err, AppError::TransientObject(_)));
    }

    #[test]
    fn test_versioned_update() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Author").unwrap();
        let author = EntityRef::new(Author::new("Herbert"));
        author.write().version = 3;

        let stmt = update(&meta, &Identifier::Integer(1), &author.link().state(), &[0], Some(2))
            .unwrap()
            .unwrap();
        assert!(stmt.sql.starts_with("UPDATE authors SET name = ?, email = ?, version = ?"));
        assert!(stmt.sql.ends_with("WHERE id = ? AND version = ?"));
        assert_eq!(stmt.params.last(), Some(&SqlValue::Integer(2)));
    }

    #[test]
    fn test_dynamic_update_writes_dirty_columns_only() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Book").unwrap();
        let book = EntityRef::new(Book::new("Dune", None));
        let pages = meta.property_index("pages").unwrap();

        let stmt = update(&meta, &Identifier::Integer(5), &book.link().state(), &[pages], None)
            .unwrap()
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE books SET pages = ? WHERE id = ?");
    }

    #[test]
    fn test_column_value_conversion() {
        let now = Utc::now();
        let text = SqlValue::Text(format_timestamp(&now));
        assert_eq!(column_value(SqlType::Timestamp, &text).unwrap(), Value::Timestamp(now));
        assert_eq!(
            column_value(SqlType::Boolean, &SqlValue::Integer(1)).unwrap(),
            Value::Boolean(true)
        );
        assert!(column_value(SqlType::Integer, &SqlValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_many_to_many_statements() {
        let model = library::library_metamodel().unwrap();
        let book = model.metadata("Book").unwrap();
        let tag = model.metadata("Tag").unwrap();
        let (_, mapping) = book.collections().next().unwrap();

        let owner = Identifier::Integer(1);
        let element = Identifier::from("rust");
        let insert = insert_element(mapping, &tag, &owner, &element);
        assert_eq!(insert.sql, "INSERT INTO book_tags (book_id, tag_id) VALUES (?, ?)");
        assert_eq!(insert.space, "book_tags");

        let remove = delete_all_elements(mapping, &tag, &owner);
        assert_eq!(remove.sql, "DELETE FROM book_tags WHERE book_id = ?");
    }
}
