use glob::glob;
use log::{error, trace, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const HWMON_DIR: &str = "/sys/class/hwmon";

/// Chiplet temperature sensors.
///
/// Every `temp*_label` under the hwmon devices whose label starts with the
/// configured prefix (k10temp reports `Tccd1`, `Tccd2`, ...) is one thermal
/// domain: the Nth matching label, in device then sensor order, is domain N.
#[derive(Debug)]
pub struct Hwmon {
    /// `temp*_input` paths, indexed by domain
    inputs: Vec<PathBuf>,
}

impl Hwmon {
    pub fn new(hwmon_root: &Path, prefix: &str) -> Self {
        let pattern = format!("{}/hwmon*/temp*_label", hwmon_root.display());
        let mut labels = Vec::<(u64, u64, PathBuf)>::new();
        match glob(&pattern) {
            Ok(paths) => {
                for path in paths {
                    match path {
                        Ok(p) => {
                            if let Some(key) = sensor_key(&p) {
                                labels.push((key.0, key.1, p));
                            }
                        }
                        Err(e) => error!("Failed to load hwmon path: {e}"),
                    }
                }
            }
            Err(e) => error!("Bad hwmon glob {pattern}: {e}"),
        }
        // glob sorts lexically: hwmon10 would precede hwmon2
        labels.sort();

        let inputs: Vec<PathBuf> = labels
            .into_iter()
            .filter(|(_, _, path)| {
                fs::read_to_string(path).is_ok_and(|label| label.trim().starts_with(prefix))
            })
            .filter_map(|(_, _, path)| {
                let name = path.file_name()?.to_str()?.replace("_label", "_input");
                Some(path.with_file_name(name))
            })
            .collect();

        if inputs.is_empty() {
            warn!("No hwmon sensor labelled '{prefix}*' under {}", hwmon_root.display());
        }
        trace!("hwmon inputs: {inputs:#?}");
        Self { inputs }
    }

    pub fn sensor_count(&self) -> usize {
        self.inputs.len()
    }

    /// `0` when the domain has no sensor or the read fails.
    pub fn read_celsius(&self, domain: usize) -> f64 {
        let Some(path) = self.inputs.get(domain) else {
            trace!("No sensor for thermal domain {domain}");
            return 0.0;
        };
        match fs::read_to_string(path) {
            Ok(text) => parse_millidegrees(&text).unwrap_or(0.0),
            Err(e) => {
                trace!("Can't read {}: {e}", path.display());
                0.0
            }
        }
    }
}

/// (hwmon index, sensor index) parsed from `.../hwmonN/tempM_label`.
fn sensor_key(path: &Path) -> Option<(u64, u64)> {
    let sensor = path
        .file_name()?
        .to_str()?
        .strip_prefix("temp")?
        .strip_suffix("_label")?
        .parse()
        .ok()?;
    let device = path
        .parent()?
        .file_name()?
        .to_str()?
        .strip_prefix("hwmon")?
        .parse()
        .ok()?;
    Some((device, sensor))
}

fn parse_millidegrees(text: &str) -> Option<f64> {
    text.trim().parse::<i64>().ok().map(|milli| milli as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sensor(root: &Path, device: u32, sensor: u32, label: &str, milli: i64) {
        let dir = root.join(format!("hwmon{device}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("temp{sensor}_label")), format!("{label}\n")).unwrap();
        fs::write(dir.join(format!("temp{sensor}_input")), format!("{milli}\n")).unwrap();
    }

    fn fixture(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("ccdbench-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_nth_label_per_domain() {
        let root = fixture("hwmon");
        write_sensor(&root, 1, 1, "Tctl", 71_000);
        write_sensor(&root, 1, 3, "Tccd1", 45_250);
        write_sensor(&root, 1, 4, "Tccd2", 52_125);
        write_sensor(&root, 0, 1, "Composite", 38_000);

        let hwmon = Hwmon::new(&root, "Tccd");
        assert_eq!(hwmon.sensor_count(), 2);
        assert_eq!(hwmon.read_celsius(0), 45.25);
        assert_eq!(hwmon.read_celsius(1), 52.125);
        assert_eq!(hwmon.read_celsius(2), 0.0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_numeric_sensor_order() {
        let root = fixture("hwmon-order");
        write_sensor(&root, 2, 10, "Tccd3", 30_000);
        write_sensor(&root, 2, 3, "Tccd1", 10_000);
        write_sensor(&root, 2, 4, "Tccd2", 20_000);

        let hwmon = Hwmon::new(&root, "Tccd");
        assert_eq!(hwmon.read_celsius(0), 10.0);
        assert_eq!(hwmon.read_celsius(1), 20.0);
        assert_eq!(hwmon.read_celsius(2), 30.0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_unreadable_input_is_zero() {
        let root = fixture("hwmon-broken");
        write_sensor(&root, 0, 1, "Tccd1", 40_000);
        fs::write(root.join("hwmon0/temp1_input"), "N/A\n").unwrap();
        let hwmon = Hwmon::new(&root, "Tccd");
        assert_eq!(hwmon.read_celsius(0), 0.0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_no_sensors() {
        let hwmon = Hwmon::new(Path::new("/nonexistent/hwmon/root"), "Tccd");
        assert_eq!(hwmon.sensor_count(), 0);
        assert_eq!(hwmon.read_celsius(0), 0.0);
    }
}
