use crate::codec::{KeyValue, ParamValue};
use crate::module::Module;
use crate::PslResult;
use log::info;

/// Instrument-level parameters read once when a module opens.
pub const CARD_PARAMS: &[&str] = &[
    "instrument.productName",
    "instrument.productId",
    "instrument.serialNumber",
    "instrument.numChannels",
    "instrument.firmwareVersion",
    "instrument.fpgaVersion",
    "instrument.fpgaId",
    "instrument.fpgaRunning",
    "instrument.appId",
    "instrument.bootloaderVersion",
    "instrument.buildDate",
    "instrument.sampleRate",
    "instrument.hostName",
];

/// Channel-level parameters included in the open-time dump.
const CHANNEL_PARAMS: &[&str] = &[
    "afe.analogGain",
    "afe.gainBoost",
    "afe.offset",
    "pulse.detectionThreshold",
    "pulse.scaleFactor",
    "histogram.binCount",
];

#[derive(Debug, Clone, Default)]
pub struct CardInfo {
    pub params: Vec<KeyValue>,
    pub channel_params: Vec<(usize, KeyValue)>,
}

impl CardInfo {
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
    }

    pub fn text(&self, key: &str) -> String {
        match self.get(key) {
            Some(ParamValue::Str(s) | ParamValue::Opt(s)) => s.clone(),
            Some(ParamValue::Int(v)) => v.to_string(),
            Some(ParamValue::Float(v)) => v.to_string(),
            Some(ParamValue::Bool(v)) => v.to_string(),
            None => String::new(),
        }
    }

    pub fn log_all(&self, alias: &str) {
        let mut param_log = String::new();
        for kv in &self.params {
            param_log.push_str(&format!("{}: {:?}\n", kv.key, kv.value));
        }
        for (ch, kv) in &self.channel_params {
            param_log.push_str(&format!("{}[{}]: {:?}\n", kv.key, ch, kv.value));
        }
        if param_log.ends_with('\n') {
            param_log.pop();
        }
        info!("Card {} parameters:\n{}", alias, param_log);
    }
}

pub fn read_card_info(module: &Module) -> PslResult<CardInfo> {
    let keys: Vec<String> = CARD_PARAMS.iter().map(|k| k.to_string()).collect();
    let params = module.get_params(0, &keys)?;

    let channel_keys: Vec<String> = CHANNEL_PARAMS.iter().map(|k| k.to_string()).collect();
    let mut channel_params = Vec::new();
    for ch in 0..module.num_channels() {
        // a channel that cannot answer only loses its dump entries
        if let Ok(values) = module.get_params(ch as i32, &channel_keys) {
            channel_params.extend(values.into_iter().map(|kv| (ch, kv)));
        }
    }
    Ok(CardInfo {
        params,
        channel_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_view_of_card_params() {
        let info = CardInfo {
            params: vec![
                KeyValue::new("instrument.productName", ParamValue::Str("FalconX8".into())),
                KeyValue::new("instrument.numChannels", ParamValue::Int(8)),
            ],
            channel_params: vec![],
        };
        assert_eq!(info.text("instrument.productName"), "FalconX8");
        assert_eq!(info.text("instrument.numChannels"), "8");
        assert_eq!(info.text("instrument.serialNumber"), "");
    }
}
