//! Reader for TESS light-curve FITS files.
//!
//! Only what a SPOC light-curve product needs is supported: header cards,
//! and scalar columns of a binary table extension. Values are big-endian.

use crate::data::LightCurve;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

/// FITS files are made of 2880-byte blocks
pub const BLOCK_SIZE: usize = 2880;

const CARD_SIZE: usize = 80;

/// Quality flags masked out by default: attitude tweak, safe mode, coarse
/// point, earth point, desaturation event, manual exclude
pub const DEFAULT_QUALITY_BITMASK: i64 = 1 | 2 | 4 | 8 | 32 | 128;

/// Parsed header of one HDU
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<(String, String)>,
}

impl Header {
    /// Parse header cards starting at `bytes[0]`
    ///
    /// Returns the header and the number of bytes it occupies, padding included.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cards = Vec::new();
        let mut offset = 0;

        loop {
            if offset + CARD_SIZE > bytes.len() {
                bail!("FITS header is truncated (no END card)");
            }
            let raw = &bytes[offset..offset + CARD_SIZE];
            if !raw.is_ascii() {
                bail!("FITS header card at byte {} is not ASCII", offset);
            }
            let card = std::str::from_utf8(raw).context("FITS header card is not ASCII")?;
            offset += CARD_SIZE;

            let keyword = card[..8].trim_end();
            if keyword == "END" {
                break;
            }
            if &card[8..10] == "= " {
                cards.push((keyword.to_string(), parse_value(&card[10..])));
            }
        }

        Ok((Self { cards }, padded(offset)))
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn require_int(&self, key: &str) -> Result<i64> {
        self.get_int(key)
            .with_context(|| format!("FITS header is missing {}", key))
    }

    /// Size of the HDU's data section, padding included
    pub fn data_size(&self) -> Result<usize> {
        let naxis = self.get_int("NAXIS").unwrap_or(0);
        if naxis == 0 {
            return Ok(0);
        }
        let bitpix = self.require_int("BITPIX")?.unsigned_abs() as usize;
        let mut elements: usize = 1;
        for axis in 1..=naxis {
            let key = format!("NAXIS{}", axis);
            let len = non_negative(&key, self.require_int(&key)?)?;
            elements = elements
                .checked_mul(len)
                .context("FITS data size overflows")?;
        }
        let pcount = non_negative("PCOUNT", self.get_int("PCOUNT").unwrap_or(0))?;
        let gcount = non_negative("GCOUNT", self.get_int("GCOUNT").unwrap_or(1))?;
        let size = pcount
            .checked_add(elements)
            .and_then(|n| n.checked_mul(gcount))
            .and_then(|n| n.checked_mul(bitpix / 8))
            .context("FITS data size overflows")?;
        Ok(padded(size))
    }
}

/// Strip the comment and quotes from a card value
fn parse_value(raw: &str) -> String {
    let raw = raw.trim_start();
    if let Some(rest) = raw.strip_prefix('\'') {
        // '' inside a string is an escaped quote
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        value.trim_end().to_string()
    } else {
        raw.split('/').next().unwrap_or("").trim().to_string()
    }
}

fn non_negative(key: &str, value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("FITS {} must not be negative, got {}", key, value))
}

fn padded(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Binary table column layout
#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    code: char,
    offset: usize,
}

/// Byte width of one element of a TFORM type code
fn type_width(code: char) -> Result<usize> {
    Ok(match code {
        'L' | 'B' | 'A' => 1,
        'I' => 2,
        'J' | 'E' => 4,
        'K' | 'D' | 'C' | 'P' => 8,
        'M' | 'Q' => 16,
        other => bail!("Unsupported FITS column type {}", other),
    })
}

/// Parse a TFORM like `D`, `1E` or `20A` into (repeat, code)
fn parse_tform(tform: &str) -> Result<(usize, char)> {
    let tform = tform.trim();
    let digits: String = tform.chars().take_while(|c| c.is_ascii_digit()).collect();
    let code = tform[digits.len()..]
        .chars()
        .next()
        .with_context(|| format!("Malformed TFORM {:?}", tform))?;
    let repeat = if digits.is_empty() { 1 } else { digits.parse()? };
    Ok((repeat, code))
}

/// Binary table extension view over a byte buffer
pub struct BinTable<'a> {
    columns: Vec<Column>,
    row_len: usize,
    rows: usize,
    data: &'a [u8],
}

impl<'a> BinTable<'a> {
    fn new(header: &Header, data: &'a [u8]) -> Result<Self> {
        let row_len = non_negative("NAXIS1", header.require_int("NAXIS1")?)?;
        let rows = non_negative("NAXIS2", header.require_int("NAXIS2")?)?;
        let fields = header.require_int("TFIELDS")?;

        if data.len() < row_len * rows {
            bail!("Binary table data is truncated");
        }

        let mut columns = Vec::new();
        let mut offset = 0;
        for i in 1..=fields {
            let tform = header
                .get(&format!("TFORM{}", i))
                .with_context(|| format!("Missing TFORM{}", i))?;
            let (repeat, code) = parse_tform(tform)?;
            let name = header
                .get(&format!("TTYPE{}", i))
                .unwrap_or("")
                .to_uppercase();
            columns.push(Column { name, code, offset });
            offset += repeat * type_width(code)?;
        }

        if offset != row_len {
            bail!("Column widths sum to {} bytes but rows are {} bytes", offset, row_len);
        }

        Ok(Self { columns, row_len, rows, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// First element of every row of a numeric column, as f64
    pub fn column_f64(&self, name: &str) -> Result<Vec<f64>> {
        let column = self
            .columns
            .iter()
            .find(|c| c.name == name)
            .with_context(|| format!("Binary table has no {} column", name))?;

        (0..self.rows)
            .map(|row| {
                let start = row * self.row_len + column.offset;
                let bytes = &self.data[start..start + type_width(column.code)?];
                read_be(column.code, bytes)
            })
            .collect()
    }
}

fn read_be(code: char, bytes: &[u8]) -> Result<f64> {
    let array = |n: usize| -> Result<[u8; 8]> {
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(buf)
    };
    Ok(match code {
        'B' => bytes[0] as f64,
        'I' => i16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        'J' => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        'K' => i64::from_be_bytes(array(8)?) as f64,
        'E' => f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        'D' => f64::from_be_bytes(array(8)?),
        other => bail!("Column type {} is not numeric", other),
    })
}

/// Read a SPOC light-curve FITS file
pub fn read_light_curve<P: AsRef<Path>>(path: P) -> Result<LightCurve> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let lc = parse_light_curve(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;
    info!("Read TIC {} ({} cadences) from {:?}", lc.tic, lc.len(), path);
    Ok(lc)
}

/// Decode the `LIGHTCURVE` extension of an in-memory FITS file
///
/// Flux is PDCSAP flux. Cadences flagged by [`DEFAULT_QUALITY_BITMASK`]
/// get NaN flux.
pub fn parse_light_curve(bytes: &[u8]) -> Result<LightCurve> {
    let (primary, header_len) = Header::parse(bytes)?;
    let mut offset = header_len + primary.data_size()?;

    while offset < bytes.len() {
        let (header, header_len) = Header::parse(&bytes[offset..])?;
        let data_start = offset + header_len;
        let data_len = header.data_size()?;
        offset = data_start + data_len;

        let is_bintable = header.get("XTENSION") == Some("BINTABLE");
        let extname = header.get("EXTNAME").unwrap_or("");
        debug!("FITS extension {:?} (bintable: {})", extname, is_bintable);
        if !is_bintable || !(extname.is_empty() || extname.eq_ignore_ascii_case("LIGHTCURVE")) {
            continue;
        }

        let data_end = (data_start + data_len).min(bytes.len());
        let table = BinTable::new(&header, &bytes[data_start..data_end])?;

        let time = table.column_f64("TIME")?;
        let mut flux: Vec<f32> = table
            .column_f64("PDCSAP_FLUX")?
            .into_iter()
            .map(|v| v as f32)
            .collect();
        let flux_err: Vec<f32> = table
            .column_f64("PDCSAP_FLUX_ERR")?
            .into_iter()
            .map(|v| v as f32)
            .collect();

        if table.has_column("QUALITY") {
            let quality = table.column_f64("QUALITY")?;
            for (f, q) in flux.iter_mut().zip(quality) {
                if (q as i64) & DEFAULT_QUALITY_BITMASK != 0 {
                    *f = f32::NAN;
                }
            }
        }

        let tic = header
            .get_int("TICID")
            .or_else(|| primary.get_int("TICID"))
            .context("FITS file has no TICID")?;
        let mut lc = LightCurve::new(tic as u64, time, flux, flux_err)?;
        lc.sector = header
            .get_int("SECTOR")
            .or_else(|| primary.get_int("SECTOR"))
            .map(|s| s as u32);
        return Ok(lc);
    }

    bail!("No LIGHTCURVE binary table found")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn card(text: &str) -> String {
        format!("{:<80}", text)
    }

    fn value_card(key: &str, value: &str) -> String {
        card(&format!("{:<8}= {:>20}", key, value))
    }

    fn pad(mut bytes: Vec<u8>, fill: u8) -> Vec<u8> {
        let len = padded(bytes.len());
        bytes.resize(len, fill);
        bytes
    }

    /// Build a minimal SPOC-like light-curve file
    pub(crate) fn synthetic_fits(tic: u64, time: &[f64], flux: &[f32], quality: &[i32]) -> Vec<u8> {
        let mut primary = String::new();
        primary += &value_card("SIMPLE", "T");
        primary += &value_card("BITPIX", "8");
        primary += &value_card("NAXIS", "0");
        primary += &value_card("TICID", &tic.to_string());
        primary += &value_card("SECTOR", "14");
        primary += &card("END");
        let mut bytes = pad(primary.into_bytes(), b' ');

        let rows = time.len();
        let mut ext = String::new();
        ext += &value_card("XTENSION", "'BINTABLE'");
        ext += &value_card("BITPIX", "8");
        ext += &value_card("NAXIS", "2");
        ext += &value_card("NAXIS1", "20");
        ext += &value_card("NAXIS2", &rows.to_string());
        ext += &value_card("PCOUNT", "0");
        ext += &value_card("GCOUNT", "1");
        ext += &value_card("TFIELDS", "4");
        ext += &value_card("TTYPE1", "'TIME    '");
        ext += &value_card("TFORM1", "'D       '");
        ext += &value_card("TTYPE2", "'PDCSAP_FLUX'");
        ext += &value_card("TFORM2", "'E       '");
        ext += &value_card("TTYPE3", "'PDCSAP_FLUX_ERR'");
        ext += &value_card("TFORM3", "'E       '");
        ext += &value_card("TTYPE4", "'QUALITY '");
        ext += &value_card("TFORM4", "'J       '");
        ext += &value_card("EXTNAME", "'LIGHTCURVE'");
        ext += &card("END");
        bytes.extend(pad(ext.into_bytes(), b' '));

        let mut data = Vec::new();
        for i in 0..rows {
            data.extend_from_slice(&time[i].to_be_bytes());
            data.extend_from_slice(&flux[i].to_be_bytes());
            data.extend_from_slice(&(flux[i] * 0.01).to_be_bytes());
            data.extend_from_slice(&quality[i].to_be_bytes());
        }
        bytes.extend(pad(data, 0));
        bytes
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("                   T / comment"), "T");
        assert_eq!(parse_value("'LIGHTCURVE'  / name"), "LIGHTCURVE");
        assert_eq!(parse_value("'O''Brien '"), "O'Brien");
        assert_eq!(parse_value("  42"), "42");
    }

    #[test]
    fn test_parse_tform() {
        assert_eq!(parse_tform("D").unwrap(), (1, 'D'));
        assert_eq!(parse_tform("1E").unwrap(), (1, 'E'));
        assert_eq!(parse_tform("20A").unwrap(), (20, 'A'));
        assert!(parse_tform("").is_err());
    }

    #[test]
    fn test_non_ascii_card_is_an_error() {
        // A two-byte character straddling the keyword/indicator boundary
        let mut bytes = card("SIMPLE  = T").into_bytes();
        bytes[7] = 0xC3;
        bytes[8] = 0xA9;
        bytes.extend(card("END").into_bytes());
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn test_negative_axis_is_an_error() {
        let mut text = String::new();
        text += &value_card("BITPIX", "8");
        text += &value_card("NAXIS", "2");
        text += &value_card("NAXIS1", "-20");
        text += &value_card("NAXIS2", "10");
        text += &card("END");
        let (header, _) = Header::parse(text.as_bytes()).unwrap();
        assert!(header.data_size().is_err());

        let mut text = String::new();
        text += &value_card("BITPIX", "64");
        text += &value_card("NAXIS", "2");
        text += &value_card("NAXIS1", &i64::MAX.to_string());
        text += &value_card("NAXIS2", &i64::MAX.to_string());
        text += &card("END");
        let (header, _) = Header::parse(text.as_bytes()).unwrap();
        assert!(header.data_size().is_err());
    }

    #[test]
    fn test_parse_light_curve() {
        let time = [1.0, 1.1, 1.2];
        let flux = [100.0f32, 105.0, 98.0];
        let quality = [0, 32, 512];
        let bytes = synthetic_fits(261136679, &time, &flux, &quality);

        let lc = parse_light_curve(&bytes).unwrap();
        assert_eq!(lc.tic, 261136679);
        assert_eq!(lc.sector, Some(14));
        assert_eq!(lc.time, time.to_vec());
        assert_eq!(lc.flux[0], 100.0);
        // desaturation flag is masked, a flag outside the bitmask is not
        assert!(lc.flux[1].is_nan());
        assert_eq!(lc.flux[2], 98.0);
        assert!((lc.flux_err[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_extension() {
        let mut primary = String::new();
        primary += &value_card("SIMPLE", "T");
        primary += &value_card("NAXIS", "0");
        primary += &card("END");
        let bytes = pad(primary.into_bytes(), b' ');
        assert!(parse_light_curve(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header() {
        assert!(Header::parse(&[b' '; 100]).is_err());
    }
}
