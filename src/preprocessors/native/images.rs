//! The native tracer's sidecar image list (§4.3): one line per image,
//! `interesting<TAB>start<TAB>end<TAB>name`.

use std::path::Path;

use crate::entity::Image;
use crate::error::TraceFormatError;

pub fn parse_image_sidecar(path: impl AsRef<Path>) -> std::io::Result<Vec<Image>> {
    let text = std::fs::read_to_string(path)?;
    parse_image_sidecar_str(&text).map_err(std::io::Error::other)
}

fn parse_image_sidecar_str(text: &str) -> Result<Vec<Image>, TraceFormatError> {
    let mut images = Vec::new();
    for (next_id, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let mut fields = line.split('\t');
        let interesting = fields
            .next()
            .ok_or(TraceFormatError::Truncated { needed: 4, have: 0 })?;
        let start = fields
            .next()
            .ok_or(TraceFormatError::Truncated { needed: 4, have: 1 })?;
        let end = fields
            .next()
            .ok_or(TraceFormatError::Truncated { needed: 4, have: 2 })?;
        let name = fields
            .next()
            .ok_or(TraceFormatError::Truncated { needed: 4, have: 3 })?;
        images.push(Image {
            id: next_id as i32,
            start: parse_u64(start)?,
            end: parse_u64(end)?,
            name: name.to_string(),
            interesting: interesting.trim() != "0",
        });
    }
    Ok(images)
}

fn parse_u64(s: &str) -> Result<u64, TraceFormatError> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| TraceFormatError::BadNameLength { len: s.len() as i32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_separated_image_lines() {
        let text = "1\t0x1000\t0x2000\tlib\n0\t0x5000\t0x6000\tother\n";
        let images = parse_image_sidecar_str(text).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].id, 0);
        assert_eq!(images[0].start, 0x1000);
        assert!(images[0].interesting);
        assert!(!images[1].interesting);
    }

    #[test]
    fn skips_blank_lines() {
        let text = "1\t0\t1\ta\n\n0\t2\t3\tb\n";
        let images = parse_image_sidecar_str(text).unwrap();
        assert_eq!(images.len(), 2);
    }
}
