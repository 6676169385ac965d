//! The source tracer's record-body dictionary compression (§4.4): dictionary
//! definitions, plain-id and letter-delta references, and suffix extension.

use std::collections::HashMap;

use crate::error::ModuleError;

/// `j` encodes delta 0; `a`..`s` span -9..+9.
fn letter_delta(c: char) -> Option<i64> {
    if !c.is_ascii_lowercase() {
        return None;
    }
    let idx = (c as u8 - b'a') as i64;
    if idx > 18 {
        return None;
    }
    Some(idx - 9)
}

/// Id → decompressed body. Reset to the prefix's snapshot at the start of
/// every test case (§4.4: "the dictionary is reset to the prefix snapshot"),
/// so it is owned outright by whichever thread is processing one test case.
pub struct Dictionary {
    bodies: HashMap<i32, String>,
    last_id: i32,
}

impl Dictionary {
    pub fn new() -> Self {
        Self {
            bodies: HashMap::new(),
            last_id: 0,
        }
    }

    pub fn from_snapshot(snapshot: &HashMap<i32, String>) -> Self {
        Self {
            bodies: snapshot.clone(),
            last_id: 0,
        }
    }

    pub fn snapshot(&self) -> HashMap<i32, String> {
        self.bodies.clone()
    }

    /// Decode every compressed token on one raw input line, in order.
    pub fn decode_line(&mut self, line: &str) -> Result<Vec<String>, ModuleError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut decoded = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let is_last = i + 1 == tokens.len();
            decoded.push(self.decode_token(token, is_last)?);
        }
        Ok(decoded)
    }

    fn err(token: &str) -> ModuleError {
        ModuleError::new("preprocess", "source", format!("malformed compressed token `{token}`"))
    }

    fn decode_token(&mut self, token: &str, is_last: bool) -> Result<String, ModuleError> {
        if let Some(rest) = token.strip_prefix("L|") {
            let (id_str, body) = rest.split_once('|').ok_or_else(|| Self::err(token))?;
            let id: i32 = id_str.parse().map_err(|_| Self::err(token))?;
            self.bodies.insert(id, body.to_string());
            self.last_id = id;
            return Ok(body.to_string());
        }

        let (head, suffix) = match token.split_once('|') {
            Some((h, s)) => (h, Some(s)),
            None => (token, None),
        };
        if suffix.is_some() && !is_last {
            return Err(Self::err(token));
        }

        let mut chars = head.chars();
        let resolved_id = match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_lowercase() => {
                let delta = letter_delta(c).ok_or_else(|| Self::err(token))?;
                self.last_id + delta
            }
            _ => head.parse::<i32>().map_err(|_| Self::err(token))?,
        };

        let decoded = match suffix {
            None => self
                .bodies
                .get(&resolved_id)
                .cloned()
                .ok_or_else(|| Self::err(token))?,
            Some(suffix) => {
                let base = self
                    .bodies
                    .get(&resolved_id)
                    .or_else(|| self.bodies.get(&self.last_id))
                    .cloned()
                    .unwrap_or_default();
                let kind = base.split(';').next().unwrap_or("");
                let body = format!("{kind}{suffix}");
                self.bodies.insert(resolved_id, body.clone());
                body
            }
        };
        self.last_id = resolved_id;
        Ok(decoded)
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_and_reuses_a_dictionary_entry() {
        let mut dict = Dictionary::new();
        let decoded = dict.decode_line("L|5|c;1:10:1:1:15:2;1:20:1:1:25:2;foo").unwrap();
        assert_eq!(decoded, vec!["c;1:10:1:1:15:2;1:20:1:1:25:2;foo".to_string()]);

        let decoded = dict.decode_line("5").unwrap();
        assert_eq!(decoded, vec!["c;1:10:1:1:15:2;1:20:1:1:25:2;foo".to_string()]);
    }

    #[test]
    fn letter_delta_with_suffix_inherits_the_referenced_kind() {
        let mut dict = Dictionary::new();
        dict.decode_line("L|5|c;1:10:1:1:15:2;1:20:1:1:25:2;foo").unwrap();
        dict.decode_line("5").unwrap();
        let decoded = dict.decode_line("k|;1:30:1:1:35:2;1:40:1:1:45:2;bar").unwrap();
        assert_eq!(decoded, vec!["c;1:30:1:1:35:2;1:40:1:1:45:2;bar".to_string()]);
    }

    #[test]
    fn reset_to_prefix_snapshot_drops_testcase_local_entries() {
        let mut dict = Dictionary::new();
        dict.decode_line("L|1|r;1:1:1:1:1:1").unwrap();
        let snapshot = dict.snapshot();

        let mut testcase_dict = Dictionary::from_snapshot(&snapshot);
        dict.decode_line("L|2|e;1:2:1:1:2:1").unwrap();
        assert!(testcase_dict.decode_line("2").is_err());
        assert_eq!(testcase_dict.decode_line("1").unwrap(), vec!["r;1:1:1:1:1:1".to_string()]);
    }

    #[test]
    fn suffix_on_a_non_final_token_is_rejected() {
        let mut dict = Dictionary::new();
        dict.decode_line("L|1|c;a;b;f").unwrap();
        assert!(dict.decode_line("1|suffix 1").is_err());
    }
}
