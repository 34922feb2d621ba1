// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, already_exists_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error};
use chrono::{DateTime, Utc};
use glob::glob;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, params};

use vigil_elements::program::{ProgramConfig, ProgramRecord, validate_program};

const MASTER_DIR: &str = "master_images";

/// Persists programs in `programs.db` and their master images as canonical
/// lossless PNGs under `master_images/`, relative to the data root.
///
/// Uploaded masters are decoded and re-encoded to PNG regardless of their
/// inbound format, so every master has the same statistical character as a
/// freshly captured frame. The matching algorithms assume this.
pub struct ProgramStore {
    data_root: PathBuf,
    conn: std::sync::Mutex<Connection>,
}

impl ProgramStore {
    pub fn open(data_root: &Path) -> Result<Self, CanonicalError> {
        fs::create_dir_all(data_root.join(MASTER_DIR))
            .map_err(|e| internal_error(
                &format!("Cannot create {}: {}", data_root.display(), e)))?;
        let conn = Connection::open(data_root.join("programs.db"))
            .map_err(db_error)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS programs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 config TEXT NOT NULL,
                 master_path TEXT NOT NULL
             )",
            []).map_err(db_error)?;
        Ok(ProgramStore {
            data_root: data_root.to_path_buf(),
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// Validates and persists a new program, returning its id. The master
    /// may arrive in any decodable format; it is re-encoded losslessly. No
    /// state changes if any step fails.
    pub fn create(&self, config: &ProgramConfig, master_bytes: &[u8])
                  -> Result<i64, CanonicalError> {
        let master = decode_master(master_bytes)?;
        validate_program(config, master.dimensions())?;
        let config_json = to_config_json(config)?;
        let now = Utc::now();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_error)?;
        tx.execute(
            "INSERT INTO programs (name, created_at, updated_at, config, \
             master_path) VALUES (?1, ?2, ?3, ?4, '')",
            params![config.name, now.to_rfc3339(), now.to_rfc3339(),
                    config_json])
            .map_err(db_error)?;
        let id = tx.last_insert_rowid();

        let master_rel = master_file_name(id, &now);
        let master_abs = self.data_root.join(&master_rel);
        // Dropping the transaction on failure rolls the row back.
        write_master_png(&master_abs, &master)?;

        let master_rel_str = master_rel.to_string_lossy().into_owned();
        let finish = match tx.execute(
            "UPDATE programs SET master_path = ?1 WHERE id = ?2",
            params![master_rel_str, id]).map_err(db_error)
        {
            Ok(_) => tx.commit().map_err(db_error),
            Err(e) => Err(e),
        };
        if let Err(e) = finish {
            // Roll the master file back so a failed write leaves nothing.
            if let Err(remove_err) = fs::remove_file(&master_abs) {
                warn!("Orphaned master {}: {}",
                      master_abs.display(), remove_err);
            }
            return Err(e);
        }
        info!("Created program {} ({})", id, config.name);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<ProgramRecord, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        let row = conn.query_row(
            "SELECT id, created_at, updated_at, config, master_path \
             FROM programs WHERE id = ?1",
            params![id],
            raw_row)
            .optional()
            .map_err(db_error)?;
        match row {
            Some(raw) => parse_record(raw),
            None => Err(not_found_error(&format!("No program with id {}", id))),
        }
    }

    pub fn list(&self) -> Result<Vec<ProgramRecord>, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT id, created_at, updated_at, config, master_path \
             FROM programs ORDER BY id")
            .map_err(db_error)?;
        let rows = statement.query_map([], raw_row).map_err(db_error)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(parse_record(row.map_err(db_error)?)?);
        }
        Ok(records)
    }

    /// Replaces a program's configuration and, when `master_bytes` is
    /// given, its master image. The stored master is untouched if
    /// revalidation fails.
    pub fn update(&self, id: i64, config: &ProgramConfig,
                  master_bytes: Option<&[u8]>) -> Result<(), CanonicalError> {
        let existing = self.get(id)?;
        let new_master = match master_bytes {
            Some(bytes) => Some(decode_master(bytes)?),
            None => None,
        };
        let dims = match &new_master {
            Some(master) => master.dimensions(),
            None => self.master_dimensions(&existing)?,
        };
        validate_program(config, dims)?;
        let config_json = to_config_json(config)?;
        let now = Utc::now();

        let (master_rel, master_abs) = match &new_master {
            Some(master) => {
                let rel = master_file_name(id, &now);
                let abs = self.data_root.join(&rel);
                write_master_png(&abs, master)?;
                (rel, Some(abs))
            },
            None => (existing.master_path.clone(), None),
        };

        let master_rel_str = master_rel.to_string_lossy().into_owned();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "UPDATE programs SET name = ?1, updated_at = ?2, config = ?3, \
             master_path = ?4 WHERE id = ?5",
            params![config.name, now.to_rfc3339(), config_json,
                    master_rel_str, id])
            .map_err(db_error);
        if let Err(e) = result {
            if let Some(abs) = master_abs {
                let _ = fs::remove_file(abs);
            }
            return Err(e);
        }
        // New master committed; retire the old file.
        if new_master.is_some() && existing.master_path != master_rel {
            let old = self.data_root.join(&existing.master_path);
            if let Err(e) = fs::remove_file(&old) {
                warn!("Could not remove old master {}: {}", old.display(), e);
            }
        }
        info!("Updated program {} ({})", id, config.name);
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<(), CanonicalError> {
        let existing = self.get(id)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM programs WHERE id = ?1", params![id])
                .map_err(db_error)?;
        }
        // Remove the master, plus any strays left by crashed updates.
        let pattern = self.data_root
            .join(MASTER_DIR)
            .join(format!("program_{}_*.png", id));
        if let Ok(paths) = glob(&pattern.to_string_lossy()) {
            for path in paths.flatten() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove master {}: {}", path.display(), e);
                }
            }
        }
        info!("Deleted program {} ({})", id, existing.config.name);
        Ok(())
    }

    /// Loads a program's master image from disk. An unreadable master is a
    /// program-level fault: the engine must not start without it.
    pub fn load_master(&self, record: &ProgramRecord)
                       -> Result<RgbImage, CanonicalError> {
        let path = self.data_root.join(&record.master_path);
        let master = image::open(&path)
            .map_err(|e| failed_precondition_error(
                &format!("Cannot load master {}: {}", path.display(), e)))?;
        Ok(master.to_rgb8())
    }

    fn master_dimensions(&self, record: &ProgramRecord)
                         -> Result<(u32, u32), CanonicalError> {
        let path = self.data_root.join(&record.master_path);
        image::image_dimensions(&path)
            .map_err(|e| failed_precondition_error(
                &format!("Cannot read master {}: {}", path.display(), e)))
    }

    /// Finds a program by its unique name.
    pub fn find_by_name(&self, name: &str)
                        -> Result<ProgramRecord, CanonicalError> {
        self.list()?
            .into_iter()
            .find(|r| r.config.name == name)
            .ok_or_else(|| not_found_error(
                &format!("No program named {}", name)))
    }
}

type RawRow = (i64, String, String, String, String);

fn raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_record(raw: RawRow) -> Result<ProgramRecord, CanonicalError> {
    let (id, created_at, updated_at, config_json, master_path) = raw;
    let config: ProgramConfig = serde_json::from_str(&config_json)
        .map_err(|e| internal_error(
            &format!("Corrupt config for program {}: {}", id, e)))?;
    Ok(ProgramRecord {
        id,
        created_at: parse_timestamp(&created_at, id)?,
        updated_at: parse_timestamp(&updated_at, id)?,
        config,
        master_path: PathBuf::from(master_path),
    })
}

fn parse_timestamp(value: &str, id: i64) -> Result<DateTime<Utc>, CanonicalError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| internal_error(
            &format!("Corrupt timestamp for program {}: {}", id, e)))
}

fn to_config_json(config: &ProgramConfig) -> Result<String, CanonicalError> {
    serde_json::to_string(config)
        .map_err(|e| internal_error(&format!("Cannot serialize config: {}", e)))
}

fn master_file_name(id: i64, timestamp: &DateTime<Utc>) -> PathBuf {
    PathBuf::from(MASTER_DIR).join(
        format!("program_{}_{}.png", id, timestamp.format("%Y%m%d_%H%M%S")))
}

fn decode_master(bytes: &[u8]) -> Result<RgbImage, CanonicalError> {
    let master = image::load_from_memory(bytes)
        .map_err(|e| invalid_argument_error(
            &format!("Cannot decode master image: {}", e)))?;
    Ok(master.to_rgb8())
}

// Canonical master encoding: lossless PNG, fast compression. Matching rates
// are only comparable when master and runtime frames share the same
// compression statistics.
fn write_master_png(path: &Path, master: &RgbImage)
                    -> Result<(), CanonicalError> {
    let file = fs::File::create(path)
        .map_err(|e| internal_error(
            &format!("Cannot create {}: {}", path.display(), e)))?;
    let encoder = PngEncoder::new_with_quality(
        BufWriter::new(file), CompressionType::Fast, FilterType::Adaptive);
    encoder.write_image(master.as_raw(), master.width(), master.height(),
                        ExtendedColorType::Rgb8)
        .map_err(|e| internal_error(
            &format!("Cannot encode {}: {}", path.display(), e)))
}

fn db_error(e: rusqlite::Error) -> CanonicalError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        already_exists_error(&format!("Program name is taken ({})", message))
    } else {
        internal_error(&format!("Database error: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb};
    use imageproc::drawing::draw_filled_circle_mut;
    use tempfile::TempDir;
    use vigil_elements::program::{
        CaptureSettings, OutputMapping, ProgramConfig, Roi, ToolConfig,
        ToolKind, TriggerSettings};
    use super::*;

    fn master_image() -> RgbImage {
        let mut img = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        draw_filled_circle_mut(&mut img, (320, 240), 100, Rgb([255, 255, 255]));
        img
    }

    fn encoded(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    fn config(name: &str) -> ProgramConfig {
        ProgramConfig {
            name: name.to_string(),
            trigger: TriggerSettings::default(),
            capture: CaptureSettings::default(),
            tools: vec![ToolConfig::new(
                1, ToolKind::Area, "disk", Roi::new(200, 140, 240, 200), 65.0)],
            outputs: OutputMapping::default(),
        }
    }

    fn master_files(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(root.join(MASTER_DIR))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_create_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let master = master_image();
        let id = store.create(
            &config("widget"), &encoded(&master, ImageFormat::Png)).unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.config, config("widget"));
        assert_eq!(record.created_at, record.updated_at);

        // Master round trip is pixel-exact for a lossless upload.
        let loaded = store.load_master(&record).unwrap();
        assert_eq!(loaded.as_raw(), master.as_raw());
        assert!(record.master_path.to_string_lossy().ends_with(".png"));
    }

    #[test]
    fn test_lossy_upload_is_reencoded_to_png() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let master = master_image();
        let id = store.create(
            &config("widget"), &encoded(&master, ImageFormat::Jpeg)).unwrap();

        let record = store.get(id).unwrap();
        assert!(record.master_path.to_string_lossy().ends_with(".png"));
        let loaded = store.load_master(&record).unwrap();
        assert_eq!(loaded.dimensions(), master.dimensions());
    }

    #[test]
    fn test_invalid_config_leaves_no_state() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let mut bad = config("widget");
        bad.tools[0].roi = Roi::new(600, 400, 100, 100);

        let master = master_image();
        assert!(store.create(&bad, &encoded(&master, ImageFormat::Png)).is_err());
        assert!(store.list().unwrap().is_empty());
        assert!(master_files(dir.path()).is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        store.create(&config("widget"), &bytes).unwrap();
        let err = store.create(&config("widget"), &bytes).unwrap_err();
        assert!(matches!(err.code,
                         canonical_error::CanonicalErrorCode::AlreadyExists));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_tool_program_is_accepted() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let mut empty = config("bare");
        empty.tools.clear();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        let id = store.create(&empty, &bytes).unwrap();
        assert!(store.get(id).unwrap().config.tools.is_empty());
    }

    #[test]
    fn test_update_config_and_master() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        let id = store.create(&config("widget"), &bytes).unwrap();
        let created = store.get(id).unwrap();

        // Master filenames carry second-resolution timestamps.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let mut new_config = config("widget-v2");
        new_config.tools[0].threshold = 80.0;
        let mut new_master = master_image();
        draw_filled_circle_mut(&mut new_master, (320, 240), 90,
                               Rgb([128, 128, 128]));
        store.update(id, &new_config,
                     Some(&encoded(&new_master, ImageFormat::Png))).unwrap();

        let updated = store.get(id).unwrap();
        assert_eq!(updated.config, new_config);
        assert!(updated.updated_at > created.updated_at);
        assert_ne!(updated.master_path, created.master_path);
        // The retired master file is gone.
        assert_eq!(master_files(dir.path()),
                   vec![dir.path().join(&updated.master_path)]);
        let loaded = store.load_master(&updated).unwrap();
        assert_eq!(loaded.as_raw(), new_master.as_raw());
    }

    #[test]
    fn test_update_without_master_revalidates_against_stored_dims() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        let id = store.create(&config("widget"), &bytes).unwrap();

        let mut bad = config("widget");
        bad.tools[0].roi = Roi::new(0, 0, 1000, 1000);
        assert!(store.update(id, &bad, None).is_err());
        // Unchanged.
        assert_eq!(store.get(id).unwrap().config, config("widget"));
    }

    #[test]
    fn test_delete_removes_row_and_master() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        let id = store.create(&config("widget"), &bytes).unwrap();

        store.delete(id).unwrap();
        assert!(store.get(id).is_err());
        assert!(store.list().unwrap().is_empty());
        assert!(master_files(dir.path()).is_empty());
    }

    #[test]
    fn test_find_by_name() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let bytes = encoded(&master_image(), ImageFormat::Png);
        store.create(&config("alpha"), &bytes).unwrap();
        let id = store.create(&config("beta"), &bytes).unwrap();
        assert_eq!(store.find_by_name("beta").unwrap().id, id);
        assert!(store.find_by_name("gamma").is_err());
    }
}  // mod tests.
