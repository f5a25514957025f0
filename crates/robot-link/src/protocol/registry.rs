//! Device discovery and client registration payloads.

use serde::{Deserialize, Serialize};

/// One robot known to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotSummary {
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub robot_type: Option<String>,
}

/// Response of `GET /api/robots`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RobotList {
    #[serde(default)]
    pub robots: Vec<RobotSummary>,
}

/// Body of `POST /api/clients/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterClientRequest<'a> {
    pub client_id: &'a str,
}
