use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;

use agentflow_core::error::Result;
use agentflow_core::traits::Catalog;
use agentflow_core::workflow::{AgentDefinition, Workflow};

use crate::store::{db_err, SqliteStore};

impl SqliteStore {
    fn load_definition<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let conn = self.lock()?;
        let sql = format!("SELECT definition FROM {} WHERE id = ?1", table);
        let raw: Option<String> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }

    fn save_definition(&self, table: &str, id: &str, definition: String) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!(
            "INSERT INTO {} (id, definition) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET definition = excluded.definition",
            table
        );
        conn.execute(&sql, params![id, definition]).map_err(db_err)?;
        Ok(())
    }
}

impl Catalog for SqliteStore {
    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<AgentDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_definition("agents", &id) })
    }

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_definition("workflows", &id) })
    }

    fn upsert_agent(&self, agent: &AgentDefinition) -> BoxFuture<'_, Result<()>> {
        let agent = agent.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&agent)?;
            self.save_definition("agents", &agent.id, definition)
        })
    }

    fn upsert_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&workflow)?;
            self.save_definition("workflows", &workflow.id, definition)
        })
    }
}
