//! Topic naming and Home Assistant MQTT discovery

use std::sync::OnceLock;

use meter_protocols::{DeviceProfile, RegisterBank};
use regex::Regex;
use serde_json::{json, Value};
use unicode_normalization::UnicodeNormalization;

use crate::config::{DeviceConfig, HomeAssistantConfig, MqttConfig};
use crate::publisher::Message;

fn non_alnum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap_or_else(|_| unreachable!()))
}

/// Lowercase ASCII slug: "PV Import/Export" -> "pv-import-export"
///
/// Accents are stripped through NFKD ("Zähler" -> "zahler"); characters
/// without an ASCII decomposition are dropped.
pub fn slugify(name: &str) -> String {
    let ascii: String = name
        .nfkd()
        .filter(char::is_ascii)
        .collect::<String>()
        .trim()
        .to_ascii_lowercase();
    non_alnum()
        .replace_all(&ascii, "-")
        .trim_matches('-')
        .to_string()
}

/// Topic segment for a device: the slug of its name, or its id when that is empty
pub fn topic_key(name: &str, id: u8) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        id.to_string()
    } else {
        slug
    }
}

pub fn state_topic(base_topic: &str, name: &str, id: u8) -> String {
    format!("{}/{}/state", base_topic, topic_key(name, id))
}

/// Friendly label and Home Assistant device class per measurement
fn sensor_meta(field: &str) -> (String, Option<&'static str>) {
    let (label, class) = match field {
        "voltage" => ("Voltage", Some("voltage")),
        "current" => ("Current", Some("current")),
        "p_active" => ("Active Power", Some("power")),
        "pf" => ("Power Factor", None),
        "freq" => ("Frequency", Some("frequency")),
        "e_total" => ("Energy Total", Some("energy")),
        "e_pos" => ("Energy Import", Some("energy")),
        "e_rev" => ("Energy Export", Some("energy")),
        other => return (other.to_string(), None),
    };
    (label.to_string(), class)
}

/// Retained sensor configs for every measurement of one device
pub fn device_discovery(
    ha: &HomeAssistantConfig,
    mqtt: &MqttConfig,
    device: &DeviceConfig,
    profile: &DeviceProfile,
) -> Vec<Message> {
    let name = device.display_name();
    let model = device.model();
    let unique_base = format!("{}_{}", model, device.id);

    let mut dev = json!({
        "identifiers": [unique_base],
        "manufacturer": profile.manufacturer(),
        "model": model.to_uppercase(),
        "name": name,
    });
    if let Some(area) = &ha.area {
        dev["area"] = Value::from(area.as_str());
    }

    let state = state_topic(&mqtt.base_topic, &name, device.id);
    let availability = json!([{ "topic": mqtt.status_topic() }]);

    profile
        .fields_for_bank(RegisterBank::Input)
        .into_iter()
        .map(|field| {
            let (label, class) = sensor_meta(&field.name);
            let unique_id = format!("{}_{}", unique_base, field.name);
            let mut payload = json!({
                "name": format!("{} {}", name, label),
                "uniq_id": unique_id,
                "stat_t": state,
                "avty": availability,
                "val_tpl": format!("{{{{ value_json.{} | float }}}}", field.name),
                "dev": dev,
            });
            if !field.unit.is_empty() {
                payload["unit_of_meas"] = Value::from(field.unit);
            }
            if let Some(class) = class {
                payload["dev_cla"] = Value::from(class);
            }
            Message {
                topic: format!("{}/sensor/{}/config", ha.discovery_prefix, unique_id),
                payload: payload.to_string(),
                retain: mqtt.retain,
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use meter_protocols::profile::sdm230;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("PV Import/Export"), "pv-import-export");
        assert_eq!(slugify("  Main DDS  "), "main-dds");
        assert_eq!(slugify("--Zähler 2--"), "zahler-2");
        assert_eq!(slugify("Caldaia Però"), "caldaia-pero");
        assert_eq!(slugify("ﬁeld ①"), "field-1");
        assert_eq!(topic_key("Straße", 4), "strae");
        assert_eq!(topic_key("电表", 4), "4");
        assert_eq!(slugify("###"), "");
        assert_eq!(topic_key("###", 5), "5");
        assert_eq!(state_topic("energy", "Main DDS", 1), "energy/main-dds/state");
        assert_eq!(
            state_topic("energia", "Contatore Cucina Più", 2),
            "energia/contatore-cucina-piu/state"
        );
    }

    #[test]
    fn test_sdm230_discovery_payloads() {
        let ha = HomeAssistantConfig {
            enabled: true,
            discovery_prefix: "homeassistant".into(),
            area: Some("Lab".into()),
        };
        let mqtt = MqttConfig::default();
        let device = DeviceConfig {
            id: 5,
            device_type: "sdm230".into(),
            name: Some("PV Import/Export".into()),
            protocol: Protocol::Rtu,
            tcp: None,
            write_order: None,
        };
        let messages = device_discovery(&ha, &mqtt, &device, &sdm230());
        assert_eq!(messages.len(), 8);
        assert!(messages.iter().all(|m| m.retain));

        let power = messages
            .iter()
            .find(|m| m.topic == "homeassistant/sensor/sdm230_5_p_active/config")
            .unwrap();
        let payload: Value = serde_json::from_str(&power.payload).unwrap();
        assert_eq!(payload["name"], "PV Import/Export Active Power");
        assert_eq!(payload["stat_t"], "energy/pv-import-export/state");
        assert_eq!(payload["avty"][0]["topic"], "energy/status");
        assert_eq!(payload["val_tpl"], "{{ value_json.p_active | float }}");
        assert_eq!(payload["unit_of_meas"], "W");
        assert_eq!(payload["dev_cla"], "power");
        assert_eq!(payload["dev"]["manufacturer"], "Eastron");
        assert_eq!(payload["dev"]["model"], "SDM230");
        assert_eq!(payload["dev"]["area"], "Lab");

        let pf = messages
            .iter()
            .find(|m| m.topic.contains("_pf/"))
            .unwrap();
        let payload: Value = serde_json::from_str(&pf.payload).unwrap();
        assert!(payload.get("unit_of_meas").is_none());
        assert!(payload.get("dev_cla").is_none());
    }
}
