use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub kafka_bootstrap_servers: String,
    pub schema_registry_url: String,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_fetch_page_size")]
    pub fetch_page_size: i64,
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    /// How long an acquired dispatch lease stays valid. Must comfortably
    /// exceed the worst case cycle time.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
    pub sentry_dsn: Option<String>,
}

fn default_dispatch_interval() -> u64 {
    3000 // Default to 3 seconds
}

fn default_fetch_page_size() -> i64 {
    100
}

fn default_delete_batch_size() -> usize {
    100
}

fn default_lease_seconds() -> i64 {
    30
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        envy::from_env::<Config>().and_then(Self::validated)
    }

    fn validated(self) -> Result<Self, envy::Error> {
        // Manually check that DATABASE_URL was loaded for the main app
        if self.database_url.is_none() {
            return Err(envy::Error::MissingValue("DATABASE_URL"));
        }

        if self.lease_seconds <= 0 {
            return Err(envy::Error::Custom(
                "LEASE_SECONDS must be positive".to_string(),
            ));
        }
        if self.fetch_page_size <= 0 {
            return Err(envy::Error::Custom(
                "FETCH_PAGE_SIZE must be positive".to_string(),
            ));
        }
        if self.delete_batch_size == 0 {
            return Err(envy::Error::Custom(
                "DELETE_BATCH_SIZE must be positive".to_string(),
            ));
        }

        Ok(self)
    }

    #[cfg(test)] // Only compile this function when running tests
    pub fn load_test() -> Result<Self, envy::Error> {
        dotenvy::from_filename_override(".env.test").ok();

        envy::from_env::<Config>()
    }

    /// Returns the database URL.
    ///
    /// # Panics
    /// Panics if the database_url is not set. This should only be
    /// called after `load()` which validates it.
    pub fn database_url(&self) -> &str {
        self.database_url
            .as_deref()
            .expect("DATABASE_URL is not set")
    }
}
