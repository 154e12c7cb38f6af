use heapless::Vec as BoundedVec;
use serde::Serialize;

pub const MAX_SCAN_RESULTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub rssi: i8,
    pub secure: bool,
}

/// One entry per SSID (strongest signal wins), hidden networks dropped,
/// strongest first, capped at `MAX_SCAN_RESULTS`.
pub fn dedupe_networks(
    scanned: impl IntoIterator<Item = ScannedNetwork>,
) -> BoundedVec<ScannedNetwork, MAX_SCAN_RESULTS> {
    let mut unique: Vec<ScannedNetwork> = Vec::new();
    for network in scanned {
        if network.ssid.trim().is_empty() {
            continue;
        }
        match unique.iter_mut().find(|known| known.ssid == network.ssid) {
            Some(known) if network.rssi > known.rssi => *known = network,
            Some(_) => {}
            None => unique.push(network),
        }
    }

    unique.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.ssid.cmp(&b.ssid)));
    unique.into_iter().take(MAX_SCAN_RESULTS).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn net(ssid: &str, rssi: i8) -> ScannedNetwork {
        ScannedNetwork {
            ssid: ssid.to_string(),
            rssi,
            secure: true,
        }
    }

    #[test]
    fn keeps_strongest_entry_per_ssid() {
        let result = dedupe_networks(vec![
            net("home", -80),
            net("cafe", -60),
            net("home", -40),
            net("", -10),
            net("home", -70),
        ]);

        assert_eq!(result.as_slice(), &[net("home", -40), net("cafe", -60)]);
    }

    #[test]
    fn caps_result_count() {
        let scanned = (0..40).map(|i| net(&format!("ap{i:02}"), -(i as i8)));
        let result = dedupe_networks(scanned);

        assert_eq!(result.len(), MAX_SCAN_RESULTS);
        assert_eq!(result[0].ssid, "ap00");
        assert_eq!(result[19].ssid, "ap19");
    }
}
