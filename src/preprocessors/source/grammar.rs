//! The source tracer's line-oriented record grammar (§4.4): one decoded
//! record per semicolon-joined body, and the `<site>` mini-grammar it
//! embeds.

use crate::error::ModuleError;

/// A code location: either a normal span (start and end positions, each a
/// `script:line:col` triple) or a reference to an external (non-instrumented)
/// function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Site {
    Source {
        script_id: i32,
        start_line: u32,
        start_col: u32,
        end_line: u32,
        end_col: u32,
    },
    External {
        name: String,
        is_call: bool,
    },
}

/// A normal site is `<script>:<startLine>:<startColumn>:<script>:<endLine>:<endColumn>`
/// — the start and end positions are each a full `script:line:col` triple, with the
/// script repeated since a span's two ends are always in the same script.
pub fn parse_site(s: &str) -> Result<Site, ModuleError> {
    let err = || ModuleError::new("preprocess", "source", format!("malformed site `{s}`"));
    if let Some(rest) = s.strip_prefix("E:") {
        let (name, flag) = match rest.rsplit_once(':') {
            Some((n, f)) => (n, f),
            None => (rest, ""),
        };
        return Ok(Site::External {
            name: name.to_string(),
            is_call: flag == "c",
        });
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(err());
    }
    let parse = |p: &str| p.parse::<u32>().map_err(|_| err());
    Ok(Site::Source {
        script_id: parts[0].parse::<i32>().map_err(|_| err())?,
        start_line: parse(parts[1])?,
        start_col: parse(parts[2])?,
        end_line: parse(parts[4])?,
        end_col: parse(parts[5])?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRecord {
    Call {
        caller: Site,
        callee: Site,
        function_name: String,
    },
    PreReturn {
        site: Site,
    },
    Return {
        from: Site,
        to: Site,
    },
    Conditional {
        site: Site,
    },
    EndExpression {
        site: Site,
    },
    HeapGet {
        site: Site,
        obj_id: i64,
        property: String,
    },
    HeapSet {
        site: Site,
        obj_id: i64,
        property: String,
    },
}

impl SourceRecord {
    /// The site a subsequent pending-conditional jump should target (§4.4:
    /// "any subsequent c/r/R/C/e/g/p ... produces a synthesized Branch ...
    /// to the new site").
    pub fn settlement_site(&self) -> &Site {
        match self {
            SourceRecord::Call { caller, .. } => caller,
            SourceRecord::PreReturn { site }
            | SourceRecord::Conditional { site }
            | SourceRecord::EndExpression { site }
            | SourceRecord::HeapGet { site, .. }
            | SourceRecord::HeapSet { site, .. } => site,
            SourceRecord::Return { from, .. } => from,
        }
    }
}

/// Parses one decompressed record body (§4.4's grammar table).
pub fn parse_record(body: &str) -> Result<SourceRecord, ModuleError> {
    let err = || ModuleError::new("preprocess", "source", format!("malformed record `{body}`"));
    let fields: Vec<&str> = body.split(';').map(str::trim).collect();
    match fields.first().copied() {
        Some("c") => {
            if fields.len() != 4 {
                return Err(err());
            }
            Ok(SourceRecord::Call {
                caller: parse_site(fields[1])?,
                callee: parse_site(fields[2])?,
                function_name: fields[3].to_string(),
            })
        }
        Some("r") => {
            if fields.len() != 2 {
                return Err(err());
            }
            Ok(SourceRecord::PreReturn {
                site: parse_site(fields[1])?,
            })
        }
        Some("R") => {
            if fields.len() != 3 {
                return Err(err());
            }
            Ok(SourceRecord::Return {
                from: parse_site(fields[1])?,
                to: parse_site(fields[2])?,
            })
        }
        Some("C") => {
            if fields.len() != 2 {
                return Err(err());
            }
            Ok(SourceRecord::Conditional {
                site: parse_site(fields[1])?,
            })
        }
        Some("e") => {
            if fields.len() != 2 {
                return Err(err());
            }
            Ok(SourceRecord::EndExpression {
                site: parse_site(fields[1])?,
            })
        }
        Some("g") => {
            if fields.len() != 4 {
                return Err(err());
            }
            Ok(SourceRecord::HeapGet {
                site: parse_site(fields[1])?,
                obj_id: fields[2].parse().map_err(|_| err())?,
                property: fields[3].to_string(),
            })
        }
        Some("p") => {
            if fields.len() != 4 {
                return Err(err());
            }
            Ok(SourceRecord::HeapSet {
                site: parse_site(fields[1])?,
                obj_id: fields[2].parse().map_err(|_| err())?,
                property: fields[3].to_string(),
            })
        }
        _ => Err(err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_call_record() {
        let rec = parse_record("c;1:10:1:1:15:2;1:20:1:1:25:2;foo").unwrap();
        // each site is a start+end (script:line:col) pair: 1:10:1 .. 1:15:2
        assert!(matches!(
            rec,
            SourceRecord::Call { ref function_name, .. } if function_name == "foo"
        ));
    }

    #[test]
    fn parses_an_external_site() {
        let site = parse_site("E:crypto.randomBytes:c").unwrap();
        assert_eq!(
            site,
            Site::External {
                name: "crypto.randomBytes".to_string(),
                is_call: true
            }
        );
    }

    #[test]
    fn rejects_malformed_record() {
        assert!(parse_record("x;bad").is_err());
    }
}
