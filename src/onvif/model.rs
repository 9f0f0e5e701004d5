//! ONVIF data model. The `source` field is only populated when the device actually reports
//! a video source configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    H264,
    H265,
    Mjpeg,
    Jpeg,
}

impl Encoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "H264" => Some(Encoding::H264),
            "H265" => Some(Encoding::H265),
            "MJPEG" => Some(Encoding::Mjpeg),
            "JPEG" => Some(Encoding::Jpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSource {
    pub name: String,
    pub resolution: Resolution,
}

/// An ONVIF media profile. `token` is the opaque identifier ONVIF calls require for
/// `GetStreamUri`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub token: String,
    pub encoding: Encoding,
    pub resolution: Resolution,
    pub quality: i32,
    pub frame_rate: i32,
    pub stream_url: Option<String>,
    pub selected: bool,
}

/// Aggregate result of a successful probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnvifInfo {
    pub host_name: String,
    pub user: String,
    pub password: String,
    pub source: Option<VideoSource>,
    pub profiles: Vec<Profile>,
}
