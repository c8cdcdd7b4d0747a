//! Immutable session snapshot handed to the controller at query creation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use gabbro_types::{QueryId, TransactionId};

/// Everything the coordinator needs to know about the submitting session.
///
/// A `Session` is a point-in-time snapshot: mutations requested by the
/// query (SET SESSION, PREPARE, ...) accumulate on the controller and are
/// applied by the client protocol layer, never written back here.
///
/// Construction uses the consuming `with_*` builder style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    query_id: QueryId,
    user: String,
    catalog: Option<String>,
    schema: Option<String>,
    path: Option<String>,
    /// Set when the client opened an explicit transaction; absent for
    /// queries the coordinator wraps in an auto-commit transaction.
    transaction_id: Option<TransactionId>,
    prepared_statements: HashMap<String, String>,
    recovery_enabled: bool,
    system_properties: HashMap<String, String>,
}

impl Session {
    pub fn new(query_id: QueryId, user: impl Into<String>) -> Self {
        Self {
            query_id,
            user: user.into(),
            catalog: None,
            schema: None,
            path: None,
            transaction_id: None,
            prepared_statements: HashMap::new(),
            recovery_enabled: false,
            system_properties: HashMap::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_prepared_statement(
        mut self,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        self.prepared_statements.insert(name.into(), sql.into());
        self
    }

    pub fn with_recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    pub fn with_system_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.system_properties.insert(name.into(), value.into());
        self
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Looks up a prepared statement registered on this session.
    pub fn prepared_statement(&self, name: &str) -> Option<&str> {
        self.prepared_statements.get(name).map(String::as_str)
    }

    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled
    }

    pub fn system_property(&self, name: &str) -> Option<&str> {
        self.system_properties.get(name).map(String::as_str)
    }
}
