//! Home Assistant tool bridge.
//!
//! Auto-discovers controllable/queryable entities, generates
//! enum-constrained tool schemas for the LLM, and executes tool calls by
//! name. Failures surface as `{"error": …}` results — never as turn-fatal
//! errors.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::{LazyLock, Mutex};
use tracing::{info, warn};

use crate::config::HassConfig;
use crate::error::Result;

/// Tool execution seam between the orchestrator and tool backends.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Tool definitions to advertise to the LLM.
    fn build_tool_schemas(&self) -> Vec<Value>;

    /// Execute a tool call by name. API-level failures come back as
    /// `{"error": …}` values; an `Err` marks the tool result as an error for
    /// the model.
    async fn execute(&self, tool_name: &str, input: &Value) -> Result<Value>;
}

/// Entity domains exposed to the model.
const ALLOWED_DOMAINS: [&str; 6] = ["light", "fan", "weather", "sensor", "switch", "climate"];

static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#?([0-9a-fA-F]{6})$").unwrap_or_else(|_| unreachable!()));
static RGB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^rgb\(\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\)$").unwrap_or_else(|_| unreachable!())
});
static HSL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:hsl\()?\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\)?$")
        .unwrap_or_else(|_| unreachable!())
});

fn named_color(name: &str) -> Option<[u8; 3]> {
    let rgb = match name {
        // English
        "red" => [255, 0, 0],
        "green" => [0, 128, 0],
        "blue" => [0, 0, 255],
        "yellow" => [255, 255, 0],
        "orange" => [255, 165, 0],
        "purple" => [128, 0, 128],
        "pink" => [255, 192, 203],
        "white" => [255, 255, 255],
        "warm" => [255, 180, 107],
        "cool" => [166, 209, 255],
        // Korean
        "빨강" => [255, 0, 0],
        "파랑" => [0, 0, 255],
        "초록" => [0, 128, 0],
        "노랑" => [255, 255, 0],
        "분홍" => [255, 192, 203],
        "보라" => [128, 0, 128],
        "주황" => [255, 165, 0],
        "하양" | "흰색" => [255, 255, 255],
        _ => return None,
    };
    Some(rgb)
}

/// HSL (h in degrees, s/l in percent) to RGB.
fn hsl_to_rgb(h: f64, s: f64, l: f64) -> [u8; 3] {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = (h % 360.0) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r1, g1, b1) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    [
        ((r1 + m) * 255.0).round() as u8,
        ((g1 + m) * 255.0).round() as u8,
        ((b1 + m) * 255.0).round() as u8,
    ]
}

/// Parse a color string to `[R, G, B]`. Recognizes named colors (English and
/// Korean), `#RRGGBB` hex, `rgb(r,g,b)`, and `hsl(h,s,l)`. Returns `None`
/// for anything else.
pub fn parse_color(input: &str) -> Option<[u8; 3]> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(rgb) = named_color(&s.to_lowercase()).or_else(|| named_color(s)) {
        return Some(rgb);
    }

    if let Some(caps) = HEX_RE.captures(s) {
        let hex = &caps[1];
        let parse = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
        return Some([parse(0..2)?, parse(2..4)?, parse(4..6)?]);
    }

    if let Some(caps) = RGB_RE.captures(s) {
        let parse = |i: usize| caps[i].parse::<u8>().ok();
        return Some([parse(1)?, parse(2)?, parse(3)?]);
    }

    if let Some(caps) = HSL_RE.captures(s) {
        let h: f64 = caps[1].parse().ok()?;
        let s_pct: f64 = caps[2].parse().ok()?;
        let l_pct: f64 = caps[3].parse().ok()?;
        return Some(hsl_to_rgb(h, s_pct / 100.0, l_pct / 100.0));
    }

    None
}

/// Home Assistant registry: discovered entities + tool schema generation +
/// execution dispatch.
pub struct HassRegistry {
    base_url: String,
    token: String,
    http: reqwest::Client,
    entities: Mutex<Vec<Value>>,
}

impl HassRegistry {
    pub fn new(config: &HassConfig) -> Self {
        Self {
            base_url: config.hass_url.trim_end_matches('/').to_owned(),
            token: config.hass_token.clone(),
            http: reqwest::Client::new(),
            entities: Mutex::new(Vec::new()),
        }
    }

    /// Fetch the entity set from the Home Assistant API, keeping only the
    /// allowed domains. Called once at startup; a failure leaves the
    /// registry empty (no HASS tools advertised).
    pub async fn discover(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/api/states", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await;
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "HASS discovery failed");
                return Ok(());
            }
            Err(e) => {
                warn!("HASS discovery failed: {e}");
                return Ok(());
            }
        };

        let all: Vec<Value> = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("HASS discovery returned bad JSON: {e}");
                return Ok(());
            }
        };
        let filtered: Vec<Value> = all
            .into_iter()
            .filter(|e| {
                e["entity_id"]
                    .as_str()
                    .and_then(|id| id.split('.').next())
                    .is_some_and(|domain| ALLOWED_DOMAINS.contains(&domain))
            })
            .collect();
        info!(count = filtered.len(), "HASS discovered");
        *self.entities.lock().unwrap_or_else(|e| e.into_inner()) = filtered;
        Ok(())
    }

    fn entity_ids(&self) -> Vec<String> {
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|e| e["entity_id"].as_str().map(str::to_owned))
            .collect()
    }

    fn entity_listing(&self) -> String {
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|e| {
                let id = e["entity_id"].as_str()?;
                let name = e["attributes"]["friendly_name"].as_str().unwrap_or("");
                Some(format!("{id} ({name})"))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn execute_control(&self, input: &Value) -> Value {
        let entity_id = input["entity_id"].as_str().unwrap_or_default();
        let action = input["action"].as_str().unwrap_or_default();
        if !self.entity_ids().iter().any(|id| id == entity_id) {
            return json!({"error": format!("Invalid entity_id: {entity_id}")});
        }
        let Some((domain, _)) = entity_id.split_once('.') else {
            return json!({"error": format!("Invalid entity_id: {entity_id}")});
        };
        if !matches!(action, "turn_on" | "turn_off" | "toggle") {
            return json!({"error": format!("Invalid action: {action}")});
        }

        let mut service_data = json!({"entity_id": entity_id});
        if let Some(brightness) = input["brightness"].as_i64() {
            service_data["brightness_pct"] = json!(brightness.clamp(0, 100));
        }
        // color_temp_kelvin wins when both are supplied.
        if let Some(kelvin) = input["color_temp_kelvin"].as_i64() {
            service_data["color_temp_kelvin"] = json!(kelvin);
        } else if let Some(color) = input["color"].as_str() {
            match parse_color(color) {
                Some(rgb) => service_data["rgb_color"] = json!(rgb),
                None => return json!({"error": format!("Unrecognized color: {color}")}),
            }
        }

        let url = format!("{}/api/services/{domain}/{action}", self.base_url);
        match self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&service_data)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => json!({"success": true}),
            Ok(r) => json!({"error": format!("HASS returned {}", r.status().as_u16())}),
            Err(e) => json!({"error": format!("HASS request failed: {e}")}),
        }
    }

    async fn execute_query(&self, input: &Value) -> Value {
        match input["query_type"].as_str() {
            Some("list_entities") => json!({"entities": self.entity_ids()}),
            Some("get_state") => {
                let entity_id = input["entity_id"].as_str().unwrap_or_default();
                if !self.entity_ids().iter().any(|id| id == entity_id) {
                    return json!({"error": format!("Invalid entity_id: {entity_id}")});
                }
                let url = format!("{}/api/states/{entity_id}", self.base_url);
                match self.http.get(url).bearer_auth(&self.token).send().await {
                    Ok(r) if r.status().is_success() => {
                        r.json().await.unwrap_or_else(|e| {
                            json!({"error": format!("bad state payload: {e}")})
                        })
                    }
                    Ok(r) => json!({"error": format!("HASS returned {}", r.status().as_u16())}),
                    Err(e) => json!({"error": format!("HASS request failed: {e}")}),
                }
            }
            other => json!({"error": format!("Invalid query_type: {other:?}")}),
        }
    }
}

#[async_trait]
impl ToolBackend for HassRegistry {
    /// `hass_control` + `hass_query` definitions with entity-id enums.
    /// Returns nothing when discovery found no entities.
    fn build_tool_schemas(&self) -> Vec<Value> {
        let entity_ids = self.entity_ids();
        if entity_ids.is_empty() {
            return Vec::new();
        }
        let listing = self.entity_listing();

        vec![
            json!({
                "name": "hass_control",
                "description": format!(
                    "Control Home Assistant device.\nAvailable: {listing}\n\
                     color and color_temp_kelvin are mutually exclusive; \
                     color_temp_kelvin takes priority."
                ),
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "entity_id": {"type": "string", "enum": entity_ids},
                        "action": {
                            "type": "string",
                            "enum": ["turn_on", "turn_off", "toggle"],
                        },
                        "brightness": {
                            "type": "integer",
                            "minimum": 0,
                            "maximum": 100,
                            "description": "Brightness percentage (lights only)",
                        },
                        "color": {
                            "type": "string",
                            "description": "Color name (red, 빨강, warm, #FF0000) — lights only",
                        },
                        "color_temp_kelvin": {
                            "type": "integer",
                            "minimum": 2200,
                            "maximum": 6500,
                            "description": "Color temperature in Kelvin — lights only",
                        },
                    },
                    "required": ["entity_id", "action"],
                },
            }),
            json!({
                "name": "hass_query",
                "description": "Query Home Assistant entity states.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "entity_id": {"type": "string", "enum": entity_ids},
                        "query_type": {
                            "type": "string",
                            "enum": ["get_state", "list_entities"],
                        },
                    },
                    "required": ["query_type"],
                },
                "cache_control": {"type": "ephemeral"},
            }),
        ]
    }

    async fn execute(&self, tool_name: &str, input: &Value) -> Result<Value> {
        info!(tool = tool_name, "tool call");
        Ok(match tool_name {
            "hass_control" => self.execute_control(input).await,
            "hass_query" => self.execute_query(input).await,
            other => json!({"error": format!("Unknown tool: {other}")}),
        })
    }
}
