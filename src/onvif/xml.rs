//! SOAP response extraction helpers. Namespace prefixes vary by camera vendor, so these walk
//! the tree by local tag name via `roxmltree::Node::tag_name()`, which already strips the
//! prefix, rather than matching on a fully-qualified name.

use roxmltree::{Document, Node};

fn find<'a, 'input>(root: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    root.descendants().find(|n| n.is_element() && n.tag_name().name() == name)
}

fn find_all<'a, 'input>(root: Node<'a, 'input>, name: &str) -> Vec<Node<'a, 'input>> {
    root.descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == name)
        .collect()
}

fn text_of<'a, 'input>(root: Node<'a, 'input>, name: &str) -> Option<String> {
    find(root, name).and_then(|n| n.text()).map(str::trim).map(String::from)
}

pub fn parse_hostname(xml: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    text_of(doc.root(), "Name")
}

pub fn is_not_authorized_fault(xml: &str) -> bool {
    xml.contains("NotAuthorized") || xml.contains("NotAuthenticated")
}

pub struct RawProfile {
    pub token: String,
    pub name: String,
    pub source_config_token: Option<String>,
    pub encoder: Option<RawEncoder>,
}

pub struct RawEncoder {
    pub encoding: String,
    pub width: u32,
    pub height: u32,
    pub quality: i32,
    pub frame_rate: i32,
}

pub fn parse_profiles(xml: &str) -> Vec<RawProfile> {
    let Ok(doc) = Document::parse(xml) else {
        return Vec::new();
    };
    find_all(doc.root(), "Profiles")
        .into_iter()
        .filter_map(|profile| {
            let token = profile.attribute("token")?.to_string();
            let name = text_of(profile, "Name").unwrap_or_default();
            let source_config_token = find(profile, "VideoSourceConfiguration")
                .and_then(|n| find(n, "SourceToken"))
                .and_then(|n| n.text())
                .map(String::from);
            let encoder = find(profile, "VideoEncoderConfiguration").map(|enc| {
                let encoding = text_of(enc, "Encoding").unwrap_or_else(|| "JPEG".to_string());
                let (width, height) = find(enc, "Resolution")
                    .map(|r| {
                        let w = text_of(r, "Width").and_then(|s| s.parse().ok()).unwrap_or(0);
                        let h = text_of(r, "Height").and_then(|s| s.parse().ok()).unwrap_or(0);
                        (w, h)
                    })
                    .unwrap_or((0, 0));
                let quality = text_of(enc, "Quality").and_then(|s| s.parse::<f32>().ok()).unwrap_or(0.0) as i32;
                let frame_rate = find(enc, "RateControl")
                    .and_then(|r| text_of(r, "FrameRateLimit"))
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                RawEncoder {
                    encoding,
                    width,
                    height,
                    quality,
                    frame_rate,
                }
            });
            Some(RawProfile {
                token,
                name,
                source_config_token,
                encoder,
            })
        })
        .collect()
}

pub struct RawVideoSource {
    pub token: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

pub fn parse_video_source_configurations(xml: &str) -> Vec<RawVideoSource> {
    let Ok(doc) = Document::parse(xml) else {
        return Vec::new();
    };
    find_all(doc.root(), "Configurations")
        .into_iter()
        .filter_map(|cfg| {
            let token = cfg.attribute("token")?.to_string();
            let name = text_of(cfg, "Name").unwrap_or_default();
            let bounds = find(cfg, "Bounds")?;
            let width = bounds.attribute("width")?.parse().ok()?;
            let height = bounds.attribute("height")?.parse().ok()?;
            Some(RawVideoSource { token, name, width, height })
        })
        .collect()
}

pub fn parse_stream_uri(xml: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    text_of(doc.root(), "Uri")
}
