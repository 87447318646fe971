//! Device discovery.
//!
//! Locates the scanout framebuffer and the panel temperature sensor through
//! sysfs, and the panel's WBF file through the device metadata partition.
//! All of this is optional plumbing around the core: the pipeline itself
//! works with any pre-selected device paths and WBF byte stream.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use epd_waveform::{Header, HEADER_LEN};

/// Find the framebuffer device with the given sysfs name.
///
/// Scans `/sys/class/graphics/*/name` and resolves the matching entry's
/// `major:minor` pair to `/dev/fb{minor}`.
pub fn find_framebuffer(name: &str) -> io::Result<Option<PathBuf>> {
    find_framebuffer_in(Path::new("/sys/class/graphics"), Path::new("/dev"), name)
}

fn find_framebuffer_in(
    sysfs: &Path,
    dev: &Path,
    name: &str,
) -> io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(sysfs)? {
        let entry = entry?;

        let device_name = match std::fs::read_to_string(entry.path().join("name")) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        if device_name.trim_end() != name {
            continue;
        }

        let numbers = match std::fs::read_to_string(entry.path().join("dev")) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        let minor = match numbers.trim_end().split_once(':') {
            Some((_, minor)) => minor.to_owned(),
            None => continue,
        };

        let path = dev.join(format!("fb{}", minor));

        if path.exists() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// Find the hwmon temperature sensor with the given sysfs name.
///
/// The sensor value file is `temp0` under the matching
/// `/sys/class/hwmon/*` entry.
pub fn find_temperature_sensor(name: &str) -> io::Result<Option<PathBuf>> {
    find_temperature_sensor_in(Path::new("/sys/class/hwmon"), name)
}

fn find_temperature_sensor_in(sysfs: &Path, name: &str) -> io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(sysfs)? {
        let entry = entry?;

        let device_name = match std::fs::read_to_string(entry.path().join("name")) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        if device_name.trim_end() != name {
            continue;
        }

        let path = entry.path().join("temp0");

        if path.exists() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// Read the length-prefixed metadata fields from the device metadata
/// partition. Lengths are big-endian 32-bit; a zero length ends the list.
fn read_metadata(device: &Path) -> io::Result<Vec<Vec<u8>>> {
    let mut file = File::open(device)?;
    let mut fields = Vec::new();

    loop {
        let mut length_bytes = [0u8; 4];
        if file.read_exact(&mut length_bytes).is_err() {
            break;
        }

        let length = u32::from_be_bytes(length_bytes);
        if length == 0 {
            break;
        }

        let mut data = vec![0u8; length as usize];
        file.read_exact(&mut data)?;
        fields.push(data);
    }

    Ok(fields)
}

/// Map a barcode symbol to its numeric value.
///
/// The alphabet is `0..9, A..H, J..N, Q..Z` (I, O, and P are skipped).
fn barcode_symbol_to_int(symbol: u8) -> Option<i16> {
    match symbol {
        b'0'..=b'9' => Some(i16::from(symbol - b'0')),
        b'A'..=b'H' => Some(i16::from(symbol - b'A') + 10),
        b'J'..=b'N' => Some(i16::from(symbol - b'J') + 18),
        b'Q'..=b'Z' => Some(i16::from(symbol - b'Q') + 23),
        _ => None,
    }
}

/// Decode the front panel laminate number from an EPD barcode.
///
/// The FPL number is carried by barcode positions 6 and 7.
fn decode_fpl_number(barcode: &[u8]) -> Option<i16> {
    if barcode.len() < 8 {
        return None;
    }

    let d6 = barcode_symbol_to_int(barcode[6])?;
    let d7 = barcode_symbol_to_int(barcode[7])?;

    if d7 < 10 {
        // Values from 0 to 329
        Some(d7 + d6 * 10)
    } else {
        // Values from 330 to 858
        Some(d7 + 320 + (d6 - 10) * 23)
    }
}

/// Discover the WBF file matching the installed panel.
///
/// Decodes the FPL number from the barcode stored in the device metadata
/// partition and matches it against the `fpl_lot` header field of the WBF
/// files shipped with the vendor software. Malformed candidate files are
/// skipped.
pub fn find_waveform_file() -> io::Result<Option<PathBuf>> {
    find_waveform_file_in(
        Path::new("/dev/mmcblk2boot1"),
        Path::new("/usr/share/remarkable"),
    )
}

fn find_waveform_file_in(metadata_device: &Path, wbf_dir: &Path) -> io::Result<Option<PathBuf>> {
    let metadata = read_metadata(metadata_device)?;

    let barcode = match metadata.get(3) {
        Some(field) => field,
        None => return Ok(None),
    };

    let fpl_lot = match decode_fpl_number(barcode) {
        Some(value) => value,
        None => return Ok(None),
    };

    for entry in std::fs::read_dir(wbf_dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().map_or(true, |ext| ext != "wbf") {
            continue;
        }

        let mut buffer = vec![0u8; HEADER_LEN];
        let read = File::open(&path).and_then(|mut file| file.read_exact(&mut buffer));
        if read.is_err() {
            continue;
        }

        match Header::parse(&buffer) {
            Ok(header) if i32::from(header.fpl_lot) == i32::from(fpl_lot) => {
                debug!(path = %path.display(), fpl_lot, "matched waveform file");
                return Ok(Some(path));
            }
            // Ignore malformed or non-matching files
            _ => continue,
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barcode_alphabet() {
        assert_eq!(barcode_symbol_to_int(b'0'), Some(0));
        assert_eq!(barcode_symbol_to_int(b'9'), Some(9));
        assert_eq!(barcode_symbol_to_int(b'A'), Some(10));
        assert_eq!(barcode_symbol_to_int(b'H'), Some(17));
        assert_eq!(barcode_symbol_to_int(b'J'), Some(18));
        assert_eq!(barcode_symbol_to_int(b'N'), Some(22));
        assert_eq!(barcode_symbol_to_int(b'Q'), Some(23));
        assert_eq!(barcode_symbol_to_int(b'Z'), Some(32));

        // I, O, and P are not part of the alphabet
        assert_eq!(barcode_symbol_to_int(b'I'), None);
        assert_eq!(barcode_symbol_to_int(b'O'), None);
        assert_eq!(barcode_symbol_to_int(b'P'), None);
    }

    #[test]
    fn test_decode_fpl_number() {
        // Positions 6-7 carry the number; d7 < 10 means d7 + d6 * 10
        assert_eq!(decode_fpl_number(b"XXXXXX47"), Some(47));
        assert_eq!(decode_fpl_number(b"XXXXXX00"), Some(0));
        // d7 >= 10 switches to the extended range
        assert_eq!(decode_fpl_number(b"XXXXXXAA"), Some(10 + 320 + 0 * 23));
        assert_eq!(decode_fpl_number(b"XXXXXXBZ"), Some(32 + 320 + 1 * 23));

        assert_eq!(decode_fpl_number(b"short"), None);
        assert_eq!(decode_fpl_number(b"XXXXXX4I"), None);
    }

    #[test]
    fn test_find_framebuffer_in_sysfs_tree() {
        let root = tempfile::tempdir().unwrap();
        let sysfs = root.path().join("graphics");
        let dev = root.path().join("dev");

        std::fs::create_dir_all(sysfs.join("fb0")).unwrap();
        std::fs::write(sysfs.join("fb0/name"), "mxs-lcdif\n").unwrap();
        std::fs::write(sysfs.join("fb0/dev"), "29:0\n").unwrap();
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("fb0"), b"").unwrap();

        let found = find_framebuffer_in(&sysfs, &dev, "mxs-lcdif").unwrap();
        assert_eq!(found, Some(dev.join("fb0")));

        let missing = find_framebuffer_in(&sysfs, &dev, "other").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_find_sensor_in_sysfs_tree() {
        let root = tempfile::tempdir().unwrap();
        let sysfs = root.path().join("hwmon");

        std::fs::create_dir_all(sysfs.join("hwmon0")).unwrap();
        std::fs::write(sysfs.join("hwmon0/name"), "sy7636a_temperature\n").unwrap();
        std::fs::write(sysfs.join("hwmon0/temp0"), "24\n").unwrap();

        let found = find_temperature_sensor_in(&sysfs, "sy7636a_temperature").unwrap();
        assert_eq!(found, Some(sysfs.join("hwmon0/temp0")));
    }

    #[test]
    fn test_read_metadata_fields() {
        let root = tempfile::tempdir().unwrap();
        let device = root.path().join("metadata");

        let mut contents = Vec::new();
        for field in [b"serial".as_slice(), b"x".as_slice(), b"y".as_slice(), b"XXXXXX47".as_slice()] {
            contents.extend_from_slice(&(field.len() as u32).to_be_bytes());
            contents.extend_from_slice(field);
        }
        contents.extend_from_slice(&0u32.to_be_bytes());
        contents.extend_from_slice(b"trailing junk");
        std::fs::write(&device, &contents).unwrap();

        let fields = read_metadata(&device).unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], b"serial");
        assert_eq!(fields[3], b"XXXXXX47");
    }
}
