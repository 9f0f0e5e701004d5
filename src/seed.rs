//! Seed camera list: the JSON array format consumed by `Agent::start`'s initial
//! `renew_seed_list`. `Port` defaults to 80, the service URL is derived from `(IP, Port)`
//! rather than read from the file, and `Profile` names the profile to mark `selected` once
//! probed.

use serde::Deserialize;

fn default_port() -> u16 {
    80
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCamera {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Profile")]
    pub profile: String,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "Passwd", default)]
    pub password: Option<String>,
}

impl SeedCamera {
    pub fn service_url(&self) -> String {
        format!("http://{}:{}/onvif/device_service", self.ip, self.port)
    }

    pub fn credentials(&self) -> Option<Vec<(String, String)>> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(vec![(user.clone(), password.clone())]),
            _ => None,
        }
    }
}

pub fn load(path: &std::path::Path) -> Result<Vec<SeedCamera>, std::io::Error> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_seed_entry() {
        let json = r#"[{"ID":"A-1","IP":"10.0.0.5","Profile":"main"}]"#;
        let seeds: Vec<SeedCamera> = serde_json::from_str(json).unwrap();
        assert_eq!(seeds[0].port, 80);
        assert_eq!(seeds[0].service_url(), "http://10.0.0.5:80/onvif/device_service");
        assert!(seeds[0].credentials().is_none());
    }

    #[test]
    fn parses_full_seed_entry() {
        let json = r#"[{"ID":"A-1","IP":"10.0.0.5","Profile":"main","Port":8080,"User":"admin","Passwd":"admin"}]"#;
        let seeds: Vec<SeedCamera> = serde_json::from_str(json).unwrap();
        assert_eq!(seeds[0].credentials(), Some(vec![("admin".to_string(), "admin".to_string())]));
    }
}
