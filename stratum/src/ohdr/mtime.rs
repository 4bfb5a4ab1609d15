//! Modification time messages
//!
//! The legacy form stores the time as 14 ASCII digits, `YYYYMMDDhhmmss`, in UTC. The newer form
//! stores seconds since the epoch as a big-endian u32. Both print in local time.

use std::io::Write;

use chrono::{DateTime, Local, NaiveDate, TimeZone};

use super::{MessageCodec, MTIME_ID, MTIME_NEW_ID};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Decoder, Encoder};

const MTIME_DIGITS: usize = 14;
const MTIME_SIZE: usize = 16;
const MTIME_NEW_VERSION: u8 = 1;
const MTIME_NEW_SIZE: usize = 8;

/// Legacy modification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mtime {
    /// Seconds since the epoch
    pub secs: i64,
}

/// Modification time, current form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MtimeNew {
    /// Seconds since the epoch
    pub secs: i64,
}

// Seconds since the epoch for a UTC calendar time. Fields outside their usual range carry into
// the next larger field, so month 13 is January of the following year.
fn utc_seconds(year: i64, month: i64, day: i64, hour: i64, min: i64, sec: i64) -> Result<i64> {
    let m0 = month - 1;
    let year = i32::try_from(year + m0.div_euclid(12))
        .map_err(|_| MetadataError::BadFormat("modification time"))?;
    let month = (m0.rem_euclid(12) + 1) as u32;
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or(MetadataError::BadFormat("modification time"))?;
    Ok(start.and_utc().timestamp() + (day - 1) * 86400 + hour * 3600 + min * 60 + sec)
}

fn print_time(
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
    secs: i64,
) -> std::io::Result<()> {
    let text = match Local.timestamp_opt(secs, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => format!("{secs} (out of range)"),
    };
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Time:", text)
}

impl MessageCodec for Mtime {
    const ID: u16 = MTIME_ID;
    const NAME: &'static str = "mtime";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let raw = dec.bytes(MTIME_SIZE)?;
        let digits = &raw[..MTIME_DIGITS];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(MetadataError::BadFormat("modification time"));
        }
        let field = |from: usize, to: usize| {
            digits[from..to]
                .iter()
                .fold(0i64, |acc, d| acc * 10 + (d - b'0') as i64)
        };
        let secs = utc_seconds(
            field(0, 4),
            field(4, 6),
            field(6, 8),
            field(8, 10),
            field(10, 12),
            field(12, 14),
        )?;
        Ok(Self { secs })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        let text = DateTime::from_timestamp(self.secs, 0)
            .map(|t| t.format("%Y%m%d%H%M%S").to_string())
            .filter(|t| t.len() == MTIME_DIGITS && t.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| {
                MetadataError::bad_value(format!(
                    "modification time {} has no 4 digit year",
                    self.secs
                ))
            })?;
        enc.bytes(text.as_bytes())?;
        enc.zeros(MTIME_SIZE - MTIME_DIGITS)
    }

    fn size(&self, _config: &FileConfig) -> usize {
        MTIME_SIZE
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        print_time(out, indent, fwidth, self.secs)
    }
}

impl MessageCodec for MtimeNew {
    const ID: u16 = MTIME_NEW_ID;
    const NAME: &'static str = "mtime_new";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let version = dec.u8()?;
        if version != MTIME_NEW_VERSION {
            return Err(MetadataError::BadVersion {
                what: "modification time",
                found: version,
            });
        }
        dec.skip(3)?;
        Ok(Self {
            secs: dec.u32_be()? as i64,
        })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        let secs = u32::try_from(self.secs).map_err(|_| {
            MetadataError::bad_value(format!(
                "modification time {} doesn't fit in 32 bits",
                self.secs
            ))
        })?;
        enc.u8(MTIME_NEW_VERSION)?;
        enc.zeros(3)?;
        enc.u32_be(secs)
    }

    fn size(&self, _config: &FileConfig) -> usize {
        MTIME_NEW_SIZE
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        print_time(out, indent, fwidth, self.secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ByteOrder;

    fn encode<T: MessageCodec>(msg: &T, config: &FileConfig) -> Result<Vec<u8>> {
        let mut image = vec![0xff; msg.size(config)];
        msg.encode(&mut Encoder::new(&mut image, config))?;
        Ok(image)
    }

    #[test]
    fn it_decodes_legacy_time() {
        let config = FileConfig::default();
        let image = b"19990917120000\0\0";
        let mtime = Mtime::decode(&mut Decoder::new(image, &config)).expect("decodes");
        assert_eq!(mtime.secs, 937569600);
        assert_eq!(encode(&mtime, &config).expect("encodes"), image);
    }

    #[test]
    fn it_rejects_non_digits() {
        let config = FileConfig::default();
        let image = b"19990X17120000\0\0";
        assert!(matches!(
            Mtime::decode(&mut Decoder::new(image, &config)),
            Err(MetadataError::BadFormat(_))
        ));
    }

    #[test]
    fn it_normalizes_out_of_range_fields() {
        let config = FileConfig::default();
        // month 13 of 1999 is January 2000, and 24:00:00 is the next midnight
        let image = b"19991301240000\0\0";
        let mtime = Mtime::decode(&mut Decoder::new(image, &config)).expect("decodes");
        assert_eq!(mtime.secs, 946771200);
    }

    #[test]
    fn it_rejects_short_legacy_time() {
        let config = FileConfig::default();
        assert!(matches!(
            Mtime::decode(&mut Decoder::new(b"19990917120000", &config)),
            Err(MetadataError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn it_encodes_new_time_big_endian() {
        for byte_order in [ByteOrder::Little, ByteOrder::Big] {
            let config = FileConfig {
                byte_order,
                ..Default::default()
            };
            let mtime = MtimeNew { secs: 1000000000 };
            let image = encode(&mtime, &config).expect("encodes");
            assert_eq!(image, [0x01, 0, 0, 0, 0x3b, 0x9a, 0xca, 0x00]);
            let decoded = MtimeNew::decode(&mut Decoder::new(&image, &config)).expect("decodes");
            assert_eq!(decoded, mtime);
        }
    }

    #[test]
    fn it_rejects_bad_new_version() {
        let config = FileConfig::default();
        let image = [0x02, 0, 0, 0, 0x3b, 0x9a, 0xca, 0x00];
        assert!(matches!(
            MtimeNew::decode(&mut Decoder::new(&image, &config)),
            Err(MetadataError::BadVersion { found: 2, .. })
        ));
    }

    #[test]
    fn it_rejects_wide_new_time() {
        let config = FileConfig::default();
        for secs in [-1, u32::MAX as i64 + 1] {
            assert!(matches!(
                encode(&MtimeNew { secs }, &config),
                Err(MetadataError::BadValue(_))
            ));
        }
        encode(&MtimeNew { secs: 0 }, &config).expect("epoch encodes");
        encode(
            &MtimeNew {
                secs: u32::MAX as i64,
            },
            &config,
        )
        .expect("u32::MAX encodes");
    }

    #[test]
    fn it_prints_time() {
        let mut out = vec![];
        MtimeNew { secs: 1000000000 }
            .debug(&mut out, 2, 8)
            .expect("prints");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("  Time:    20"));
    }
}
