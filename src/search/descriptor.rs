use crate::keys::{IndexKey, KeyType, TimeVal32};
use anyhow::{bail, Context, Result};
use std::path::Path;

/// One `<keytype> <result_name> <start> <end>` directive.
#[derive(Clone, Debug)]
pub struct SubIndexSearch {
    pub kt: KeyType,
    pub result_name: String,
    pub start: IndexKey,
    pub end: IndexKey,
}

/// One operand of an AND line; `sub_id` indexes the sub-search list.
#[derive(Clone, Copy, Debug)]
pub struct AndItem {
    pub sub_id: usize,
    pub inverted: bool,
}

#[derive(Clone, Debug)]
pub struct AndOp {
    pub result_name: String,
    pub items: Vec<AndItem>,
}

/// A parsed search description: sub-index range scans feeding AND
/// operations feeding the single OR, plus time/proto filters and the
/// interval lists.
#[derive(Clone, Debug)]
pub struct SearchDescriptor {
    pub sub_searches: Vec<SubIndexSearch>,
    pub and_ops: Vec<AndOp>,
    pub or_result_name: String,
    pub start_ts: TimeVal32,
    pub end_ts: TimeVal32,
    pub proto: u8,
    /// (result name, interval ids) needing the time filter.
    pub partial: Option<(String, Vec<u64>)>,
    /// (result name, interval ids) entirely inside the time window.
    pub full: Option<(String, Vec<u64>)>,
}

impl SearchDescriptor {
    pub fn parse_file(path: &Path) -> Result<SearchDescriptor> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read search description {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("parse search description {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<SearchDescriptor> {
        let mut sub_searches = Vec::new();
        let mut and_ops = Vec::new();
        let mut or_result_name: Option<String> = None;
        let mut start_ts = TimeVal32::new(0, 0);
        let mut end_ts = TimeVal32::MAX;
        let mut proto: u8 = 0;
        let mut partial = None;
        let mut full = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut toks = line.split_whitespace();
            let head = toks.next().unwrap();

            if let Some(kt) = KeyType::from_name(head) {
                let result_name = toks
                    .next()
                    .ok_or_else(|| parse_err(lineno, "missing result name"))?
                    .to_string();
                let start_tok =
                    toks.next().ok_or_else(|| parse_err(lineno, "missing start key"))?;
                let end_tok =
                    toks.next().ok_or_else(|| parse_err(lineno, "missing end key"))?;
                let start = IndexKey::parse(kt, start_tok)
                    .with_context(|| format!("line {}: bad start key", lineno + 1))?;
                let end = IndexKey::parse(kt, end_tok)
                    .with_context(|| format!("line {}: bad end key", lineno + 1))?;
                if start > end {
                    bail!("line {}: start key is greater than end key", lineno + 1);
                }
                if toks.next().is_some() {
                    bail!("line {}: trailing data in sub-index search", lineno + 1);
                }
                sub_searches.push(SubIndexSearch { kt, result_name, start, end });
                continue;
            }

            match head {
                "AND" => {
                    let result_name = toks
                        .next()
                        .ok_or_else(|| parse_err(lineno, "missing AND result name"))?
                        .to_string();
                    let mut items = Vec::new();
                    for tok in toks {
                        let (tok, inverted) = match tok.strip_prefix('!') {
                            Some(rest) => (rest, true),
                            None => (tok, false),
                        };
                        let sub_id: usize = tok.parse().map_err(|_| {
                            parse_err(lineno, "bad sub-search id in AND operation")
                        })?;
                        items.push(AndItem { sub_id, inverted });
                    }
                    if items.is_empty() {
                        bail!("line {}: empty AND operation", lineno + 1);
                    }
                    if items.iter().all(|i| i.inverted) {
                        bail!(
                            "line {}: an AND operation needs at least one non-inverted input",
                            lineno + 1
                        );
                    }
                    and_ops.push(AndOp { result_name, items });
                }
                "OR" => {
                    if or_result_name.is_some() {
                        bail!("line {}: only one OR line is allowed", lineno + 1);
                    }
                    or_result_name = Some(
                        toks.next()
                            .ok_or_else(|| parse_err(lineno, "missing OR result name"))?
                            .to_string(),
                    );
                }
                "START" => {
                    let tok =
                        toks.next().ok_or_else(|| parse_err(lineno, "missing timestamp"))?;
                    start_ts = TimeVal32::parse(tok)
                        .with_context(|| format!("line {}: bad START timestamp", lineno + 1))?;
                }
                "END" => {
                    let tok =
                        toks.next().ok_or_else(|| parse_err(lineno, "missing timestamp"))?;
                    end_ts = TimeVal32::parse(tok)
                        .with_context(|| format!("line {}: bad END timestamp", lineno + 1))?;
                }
                "PROTO" => {
                    let tok =
                        toks.next().ok_or_else(|| parse_err(lineno, "missing protocol"))?;
                    proto = tok
                        .parse()
                        .map_err(|_| parse_err(lineno, "bad protocol number"))?;
                }
                "PARTIAL" => {
                    partial = Some(parse_interval_list(lineno, &mut toks)?);
                }
                "FULL" => {
                    full = Some(parse_interval_list(lineno, &mut toks)?);
                }
                other => bail!("line {}: unknown directive {other:?}", lineno + 1),
            }
        }

        let or_result_name =
            or_result_name.ok_or_else(|| anyhow::anyhow!("missing OR line"))?;

        // Every AND operand must name a real sub-search.
        for op in &and_ops {
            for item in &op.items {
                if item.sub_id >= sub_searches.len() {
                    bail!(
                        "AND operation {} references sub-search {} which doesn't exist",
                        op.result_name,
                        item.sub_id
                    );
                }
            }
        }
        if and_ops.is_empty() {
            bail!("a search needs at least one AND operation");
        }

        Ok(SearchDescriptor {
            sub_searches,
            and_ops,
            or_result_name,
            start_ts,
            end_ts,
            proto,
            partial,
            full,
        })
    }
}

fn parse_err(lineno: usize, msg: &str) -> anyhow::Error {
    anyhow::anyhow!("line {}: {msg}", lineno + 1)
}

fn parse_interval_list<'a>(
    lineno: usize,
    toks: &mut impl Iterator<Item = &'a str>,
) -> Result<(String, Vec<u64>)> {
    let name = toks
        .next()
        .ok_or_else(|| parse_err(lineno, "missing result name"))?
        .to_string();
    let mut ids = Vec::new();
    for tok in toks {
        ids.push(
            tok.parse::<u64>()
                .map_err(|_| parse_err(lineno, "bad interval id"))?,
        );
    }
    Ok((name, ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
SRCv4 src_range 10.0.0.0 10.0.0.255
DSTPORT dns 53 53
AND res1 0 1
AND res2 !1 0
OR combined
START 1454509487.534286
END 1454509999.0
PROTO 17
PARTIAL edge 3 9
FULL mid 4 5 6
";

    #[test]
    fn parses_a_full_descriptor() {
        let d = SearchDescriptor::parse(SAMPLE).unwrap();
        assert_eq!(d.sub_searches.len(), 2);
        assert_eq!(d.sub_searches[0].kt, KeyType::SrcV4);
        assert_eq!(d.sub_searches[1].kt, KeyType::DstPort);
        assert_eq!(d.and_ops.len(), 2);
        assert!(d.and_ops[1].items[0].inverted);
        assert_eq!(d.and_ops[1].items[0].sub_id, 1);
        assert_eq!(d.or_result_name, "combined");
        assert_eq!(d.start_ts, TimeVal32::new(1454509487, 534286));
        assert_eq!(d.proto, 17);
        assert_eq!(d.partial, Some(("edge".to_string(), vec![3, 9])));
        assert_eq!(d.full, Some(("mid".to_string(), vec![4, 5, 6])));
    }

    #[test]
    fn rejects_inverted_only_and() {
        let text = "SRCPORT p 1 2\nAND r !0\nOR o\n";
        assert!(SearchDescriptor::parse(text).is_err());
    }

    #[test]
    fn rejects_dangling_sub_id() {
        let text = "SRCPORT p 1 2\nAND r 3\nOR o\n";
        assert!(SearchDescriptor::parse(text).is_err());
    }

    #[test]
    fn rejects_reversed_key_range() {
        let text = "SRCPORT p 9 2\nAND r 0\nOR o\n";
        assert!(SearchDescriptor::parse(text).is_err());
    }

    #[test]
    fn defaults_cover_all_time_and_protocols() {
        let d = SearchDescriptor::parse("SRCPORT p 1 2\nAND r 0\nOR o\n").unwrap();
        assert_eq!(d.start_ts, TimeVal32::new(0, 0));
        assert_eq!(d.end_ts, TimeVal32::MAX);
        assert_eq!(d.proto, 0);
    }
}
