// Query - typed criteria over one entity's table
// Results go through the identity map, so managed instances are reused

use std::fmt;
use std::marker::PhantomData;

use crate::core::Value;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::infrastructure::Statement;
use crate::mapping::{Entity, EntityMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    IsNotNull,
}

impl Predicate {
    fn operator(self) -> &'static str {
        match self {
            Predicate::Eq => "=",
            Predicate::Ne => "<>",
            Predicate::Lt => "<",
            Predicate::Le => "<=",
            Predicate::Gt => ">",
            Predicate::Ge => ">=",
            Predicate::Like => "LIKE",
            Predicate::IsNull => "IS NULL",
            Predicate::IsNotNull => "IS NOT NULL",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, Predicate::IsNull | Predicate::IsNotNull)
    }
}

#[derive(Debug, Clone)]
struct Filter {
    property: String,
    predicate: Predicate,
    value: Value,
}

pub struct Query<T: Entity> {
    filters: Vec<Filter>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
    marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            order: self.order.clone(),
            limit: self.limit,
            marker: PhantomData,
        }
    }
}

impl<T: Entity> Default for Query<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &T::entity_name())
            .field("filters", &self.filters)
            .field("order", &self.order)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<T: Entity> Query<T> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            marker: PhantomData,
        }
    }

    pub fn filter(mut self, property: &str, predicate: Predicate, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            property: property.to_string(),
            predicate,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, property: &str, value: impl Into<Value>) -> Self {
        self.filter(property, Predicate::Eq, value)
    }

    pub fn is_null(self, property: &str) -> Self {
        self.filter(property, Predicate::IsNull, Value::Null)
    }

    pub fn order_by(mut self, property: &str) -> Self {
        self.order.push((property.to_string(), false));
        self
    }

    pub fn order_by_desc(mut self, property: &str) -> Self {
        self.order.push((property.to_string(), true));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Property names resolve to columns; `id` and the id column name the identifier
    fn column<'m>(meta: &'m EntityMetadata, property: &str) -> AppResult<&'m str> {
        if property == "id" || property == meta.id.column {
            return Ok(&meta.id.column);
        }
        let (_, mapping) = meta.property(property)?;
        mapping.column.as_deref().ok_or_else(|| {
            AppError::InvalidArgument(format!(
                "{}.{} is a collection and cannot be queried on",
                meta.name, property
            ))
        })
    }

    pub(crate) fn to_statement(&self, meta: &EntityMetadata) -> AppResult<Statement> {
        let mut statement = Statement::new(
            format!("SELECT {} FROM {}", sql::select_columns(meta), meta.table),
            &meta.table,
        );

        let mut clauses = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            let column = Self::column(meta, &filter.property)?;
            if filter.predicate.takes_value() {
                clauses.push(format!("{} {} ?", column, filter.predicate.operator()));
                statement = statement.bind(sql::to_sql_value(&filter.value)?);
            } else {
                clauses.push(format!("{} {}", column, filter.predicate.operator()));
            }
        }
        if !clauses.is_empty() {
            statement.sql.push_str(" WHERE ");
            statement.sql.push_str(&clauses.join(" AND "));
        }

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(property, descending)| {
                    Self::column(meta, property)
                        .map(|c| if *descending { format!("{} DESC", c) } else { c.to_string() })
                })
                .collect::<AppResult<Vec<_>>>()?;
            statement.sql.push_str(" ORDER BY ");
            statement.sql.push_str(&order.join(", "));
        }
        if let Some(limit) = self.limit {
            statement.sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(statement)
    }
}
