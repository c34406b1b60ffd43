/// Test utilities and helpers for datastore client testing
///
/// Provides an in-memory backend, a client wrapper bound to it and a few
/// entity fixtures.
pub mod memory_backend;

pub use memory_backend::{BackendCall, BackendOp, MemoryBackend, FIRST_ALLOCATED_ID};

use kds_client::{Client, ClientConfig};
use kds_core::{key_path, Entity, Key};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Default project of test clients
pub const TEST_PROJECT: &str = "test-project";

/// Install a test-friendly tracing subscriber once per process
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Client wired to a fresh [`MemoryBackend`]
pub struct TestClient {
    pub client: Client,
    pub backend: Arc<MemoryBackend>,
}

impl TestClient {
    /// Create a client for [`TEST_PROJECT`]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::new(TEST_PROJECT))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new());
        let client = Client::new(config, backend.clone()).expect("Failed to create client");
        backend.clear_calls();
        Self { client, backend }
    }

    /// Another client of the same project sharing this backend
    pub fn sibling(&self) -> Client {
        Client::new(self.client.config().clone(), self.backend.clone())
            .expect("Failed to create client")
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Entity fixture generator
pub struct PersonGenerator {
    project: String,
    counter: i64,
}

impl PersonGenerator {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            counter: 0,
        }
    }

    /// Person with a partial key
    pub fn partial(&mut self) -> Entity {
        self.counter += 1;
        let key = Key::new(self.project.clone(), key_path!["Person"]).expect("valid key");
        self.person(key)
    }

    /// Person with a complete key, ids counting up from 1
    pub fn complete(&mut self) -> Entity {
        self.counter += 1;
        let key =
            Key::new(self.project.clone(), key_path!["Person", self.counter]).expect("valid key");
        self.person(key)
    }

    fn person(&self, key: Key) -> Entity {
        Entity::with_key(key)
            .with_property("name", format!("person{}", self.counter))
            .with_property("age", 15 + self.counter * 3)
    }
}

impl Default for PersonGenerator {
    fn default() -> Self {
        Self::new(TEST_PROJECT)
    }
}

/// Seed `count` people with complete keys
pub fn seed_people(backend: &MemoryBackend, count: usize) -> Vec<Entity> {
    let mut gen = PersonGenerator::default();
    (0..count)
        .map(|_| {
            let person = gen.complete();
            backend.seed(person.clone());
            person
        })
        .collect()
}
