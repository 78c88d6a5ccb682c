use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical instance liveness values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// Endpoint holds the management connection parameters for an instance
#[derive(Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// Instance represents one managed VyOS router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub endpoint: Endpoint,
    pub version: String,
    pub liveness: Liveness,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// RegisterInstanceRequest for adding an instance to the registry.
/// Also the element type of the instance seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInstanceRequest {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub version: String,
}

impl RegisterInstanceRequest {
    /// Build the endpoint, using `default_port` when none was given
    pub fn endpoint(&self, default_port: u16) -> Endpoint {
        Endpoint::new(&self.host, &self.username, &self.password)
            .with_port(self.port.unwrap_or(default_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_password_never_serialized() {
        let endpoint = Endpoint::new("192.0.2.1", "vyos", "s3cret");
        let json = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(json["host"], "192.0.2.1");
        assert_eq!(json["port"], 22);
        assert!(json.get("password").is_none());
        assert!(!format!("{:?}", endpoint).contains("s3cret"));
    }

    #[test]
    fn test_register_request_default_port() {
        let req: RegisterInstanceRequest = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "host": "r1.lab",
            "username": "vyos",
            "password": "vyos",
            "version": "1.4"
        }))
        .unwrap();
        assert_eq!(req.endpoint(2222).port, 2222);
        assert_eq!(req.endpoint(22).password, "vyos");

        let req = RegisterInstanceRequest {
            port: Some(830),
            ..req
        };
        assert_eq!(req.endpoint(22).port, 830);
    }
}
