//! Serial driver for the global alignment PSD box.
//!
//! The PSD box streams one line per sample at 115200 baud once it has been
//! put in measurement mode. A line carries nine whitespace-separated values:
//!
//! ```text
//! x1 y1 x2 y2 dx1 dy1 dx2 dy2 temperature
//! ```
//!
//! Lines starting with `#` are diagnostic chatter and are skipped.
//!
//! # Example
//!
//! ```no_run
//! use hardware::{PsdSensor, SerialPsd};
//!
//! let mut psd = SerialPsd::connect("/dev/ttyACM0")?;
//! let channels = psd.read()?;
//! println!("x1 = {}", channels[0]);
//! # Ok::<(), hardware::HardwareError>(())
//! ```

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, trace};

use crate::interfaces::{PsdSensor, PSD_CHANNELS};
use crate::{HardwareError, HardwareResult};

/// Baud rate of the PSD box.
pub const BAUD_RATE: u32 = 115_200;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Upper bound on comment lines to skip before giving up on a sample.
const MAX_SKIPPED_LINES: usize = 64;

/// PSD box attached to a serial port.
pub struct SerialPsd {
    path: String,
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialPsd {
    /// Open the port and switch the box into measurement mode.
    pub fn connect(path: &str) -> HardwareResult<Self> {
        let mut port = serialport::new(path, BAUD_RATE)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;

        // debug output, then continuous measurements
        port.write_all(b"d")?;
        port.write_all(b"m")?;
        port.flush()?;

        info!("Connected to PSD on {path}");
        Ok(Self {
            path: path.to_string(),
            reader: BufReader::new(port),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PsdSensor for SerialPsd {
    fn read(&mut self) -> HardwareResult<[f64; PSD_CHANNELS]> {
        let channels = read_sample(&mut self.reader)?;
        debug!("PSD {}: {:?}", self.path, channels);
        Ok(channels)
    }
}

/// Read lines until a data line arrives and parse it.
pub fn read_sample<R: BufRead>(reader: &mut R) -> HardwareResult<[f64; PSD_CHANNELS]> {
    let mut line = String::new();
    for _ in 0..MAX_SKIPPED_LINES {
        line.clear();
        let n = reader.read_line(&mut line).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => HardwareError::Timeout,
            _ => HardwareError::Io(e),
        })?;
        if n == 0 {
            return Err(HardwareError::InvalidResponse(
                "PSD stream closed".to_string(),
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            trace!("PSD skipped: {trimmed}");
            continue;
        }
        return parse_sample(trimmed);
    }

    Err(HardwareError::InvalidResponse(format!(
        "no data line within {MAX_SKIPPED_LINES} lines"
    )))
}

/// Parse one data line into the nine raw channels.
pub fn parse_sample(line: &str) -> HardwareResult<[f64; PSD_CHANNELS]> {
    let mut channels = [0.0; PSD_CHANNELS];
    let mut fields = line.split_whitespace();

    for (i, channel) in channels.iter_mut().enumerate() {
        let field = fields.next().ok_or_else(|| {
            HardwareError::InvalidResponse(format!("expected {PSD_CHANNELS} values, got {i}: '{line}'"))
        })?;
        *channel = field
            .parse()
            .map_err(|_| HardwareError::InvalidResponse(format!("bad value '{field}' in '{line}'")))?;
    }

    Ok(channels)
}
