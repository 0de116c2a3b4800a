//! Storage for edge sensor calibration.
//!
//! Each MPES gets one JSON file named after its address, holding its panel
//! sides, response matrices, aligned readings and systematic offsets. All
//! files live under ~/.pas_config/mpes by default.

use std::path::{Path, PathBuf};

use crate::mpes::MpesCalibration;

#[derive(Debug, Clone)]
pub struct CalibrationStore {
    /// Root directory for all configuration (e.g., ~/.pas_config)
    root_path: PathBuf,
}

impl CalibrationStore {
    /// Create a store at the default path (~/.pas_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".pas_config"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn mpes_dir(&self) -> PathBuf {
        self.root_path.join("mpes")
    }

    fn mpes_filename(&self, address: &str) -> PathBuf {
        let safe = address.replace(['/', ' '], "_");
        self.mpes_dir().join(format!("{safe}.json"))
    }

    /// Calibration of the MPES at `address`.
    ///
    /// Returns None if nothing has been saved for it, Some(Err) if the file
    /// exists but cannot be loaded.
    pub fn load_mpes(&self, address: &str) -> Option<std::io::Result<MpesCalibration>> {
        let path = self.mpes_filename(address);
        if !path.exists() {
            return None;
        }
        Some(std::fs::read_to_string(&path).and_then(|json| {
            serde_json::from_str(&json)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }))
    }

    /// Save the calibration of the MPES at `address`, returning the path.
    pub fn save_mpes(&self, address: &str, calibration: &MpesCalibration) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(self.mpes_dir())?;
        let path = self.mpes_filename(address);
        let json = serde_json::to_string_pretty(calibration)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Addresses of every stored MPES calibration.
    pub fn list_mpes(&self) -> std::io::Result<Vec<String>> {
        let dir = self.mpes_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut addresses = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    addresses.push(stem.to_string());
                }
            }
        }
        addresses.sort();
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpes::PanelSide;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store() -> CalibrationStore {
        let dir = std::env::temp_dir().join(format!(
            "pas_calibration_test_{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        CalibrationStore::with_path(dir)
    }

    #[test]
    fn test_save_and_load() {
        let store = temp_store();
        let mut calibration = MpesCalibration::default();
        calibration.sides.insert(1001, PanelSide::W);
        calibration.sides.insert(1002, PanelSide::L);
        calibration.response.insert(PanelSide::W, [[0.5; 6], [-0.25; 6]]);
        calibration.aligned = Some([160.2, 119.8]);
        calibration.systematic_offsets = [0.1, -0.1];

        assert!(store.load_mpes("sn-42").is_none());
        store.save_mpes("sn-42", &calibration).unwrap();

        let loaded = store.load_mpes("sn-42").unwrap().unwrap();
        assert_eq!(loaded, calibration);
        assert_eq!(store.list_mpes().unwrap(), vec!["sn-42".to_string()]);

        std::fs::remove_dir_all(store.root_path()).ok();
    }

    #[test]
    fn test_corrupt_file() {
        let store = temp_store();
        std::fs::create_dir_all(store.mpes_dir()).unwrap();
        std::fs::write(store.mpes_filename("bad"), "[1, 2").unwrap();

        let err = store.load_mpes("bad").unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        std::fs::remove_dir_all(store.root_path()).ok();
    }
}
