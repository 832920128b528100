//! Initiator-side key sequences, one per distributed query.
//!
//! Every pull served for a query takes the next key from that query's
//! sequence under its mutex, so concurrent pulls never see the same key and
//! exhaustion is observed atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ClusterError, Result};

type KeySequence = Box<dyn Iterator<Item = String> + Send>;

/// Shared map from initial query id to its key sequence.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    sequences: Arc<Mutex<HashMap<String, Arc<Mutex<KeySequence>>>>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("queries", &self.active_queries())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key sequence of `query_id`.
    ///
    /// The sequence stays served until the returned guard is dropped.
    pub fn register<I>(&self, query_id: &str, keys: I) -> Result<TaskRegistration>
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        if sequences.contains_key(query_id) {
            return Err(ClusterError::Config(format!(
                "query '{query_id}' already has a registered key sequence"
            )));
        }

        // Fused so that pulls after exhaustion keep returning None.
        let sequence: KeySequence = Box::new(keys.into_iter().fuse());
        sequences.insert(query_id.to_string(), Arc::new(Mutex::new(sequence)));
        crate::cluster_debug!("task-registry", "Registered key sequence for query {query_id}");

        Ok(TaskRegistration {
            registry: self.clone(),
            query_id: query_id.to_string(),
        })
    }

    /// Take the next key of `query_id`; `Ok(None)` once exhausted.
    pub fn next_task(&self, query_id: &str) -> Result<Option<String>> {
        let sequence = self
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(query_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownQuery(query_id.to_string()))?;

        let next = sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();

        match &next {
            Some(key) => crate::cluster_trace!("task-registry", "query {query_id}: handing out {key}"),
            None => crate::cluster_trace!("task-registry", "query {query_id}: key sequence exhausted"),
        }
        Ok(next)
    }

    pub fn is_registered(&self, query_id: &str) -> bool {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(query_id)
    }

    pub fn active_queries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn deregister(&self, query_id: &str) {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(query_id);
        crate::cluster_debug!("task-registry", "Deregistered key sequence for query {query_id}");
    }
}

/// Keeps one query's key sequence registered while alive.
#[derive(Debug)]
pub struct TaskRegistration {
    registry: TaskRegistry,
    query_id: String,
}

impl TaskRegistration {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Drop for TaskRegistration {
    fn drop(&mut self) {
        self.registry.deregister(&self.query_id);
    }
}
