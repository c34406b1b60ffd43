use std::collections::HashMap;

/// Client configuration: project scope, opaque credentials and options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Project every key, batch and query of the client is scoped to
    pub project: String,

    /// Default namespace for keys and queries (None = default namespace)
    pub namespace: Option<String>,

    /// Opaque credentials handed to the backend untouched
    pub credentials: Option<String>,

    /// Free-form client identification passed through to the backend
    pub client_info: HashMap<String, String>,

    /// Free-form backend options
    pub client_options: HashMap<String, String>,

    /// Upper bound on the limit of each individual query page request
    /// (None = let the backend decide)
    pub page_size: Option<usize>,
}

impl ClientConfig {
    /// Create a configuration for `project` with default values
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            namespace: None,
            credentials: None,
            client_info: HashMap::new(),
            client_options: HashMap::new(),
            page_size: None,
        }
    }

    /// Set the default namespace. An empty string means no namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        self
    }

    /// Set opaque credentials
    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Add a client info entry
    pub fn with_client_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_info.insert(key.into(), value.into());
        self
    }

    /// Add a client option
    pub fn with_client_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_options.insert(key.into(), value.into());
        self
    }

    /// Cap the size of each query page request
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.project.is_empty() {
            return Err("project must not be empty".to_string());
        }

        if let Some(size) = self.page_size {
            if size == 0 {
                return Err("page_size must be greater than 0 when set".to_string());
            }
        }

        Ok(())
    }
}
