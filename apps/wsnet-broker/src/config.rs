use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("WSNET_BROKER_BIND").unwrap_or(defaults.bind),
            port: env::var("WSNET_BROKER_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bind_address() {
        let config = Config {
            bind: "127.0.0.1".into(),
            port: 9000,
        };
        assert_eq!(config.address(), "127.0.0.1:9000");
        assert_eq!(Config::default().address(), "0.0.0.0:8080");
    }
}
