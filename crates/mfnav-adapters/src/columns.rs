use std::collections::HashMap;

use strsim::jaro_winkler;

use crate::AdapterError;

const FUZZY_THRESHOLD: f64 = 0.92;

/// A canonical column and the upstream header spellings that map onto it.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

impl ColumnSpec {
    pub const fn required(canonical: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            canonical,
            aliases,
            required: true,
        }
    }

    pub const fn optional(canonical: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            canonical,
            aliases,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchPass {
    Exact,
    Contains,
    Fuzzy,
}

/// Canonical column name -> header position, resolved once per payload.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    positions: HashMap<&'static str, usize>,
    width: usize,
}

impl ColumnMap {
    /// Resolve `specs` against a header row.
    ///
    /// All specs are tried with exact matching first, then substring
    /// containment, then Jaro-Winkler similarity, and a header cell is claimed
    /// by at most one canonical column.
    pub fn resolve<'h, I>(header: I, specs: &[ColumnSpec]) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = &'h str>,
    {
        let cells: Vec<String> = header.into_iter().map(header_key).collect();
        let mut claimed = vec![false; cells.len()];
        let mut positions = HashMap::new();

        for pass in [MatchPass::Exact, MatchPass::Contains, MatchPass::Fuzzy] {
            for spec in specs {
                if positions.contains_key(spec.canonical) {
                    continue;
                }
                let found = spec.aliases.iter().find_map(|alias| {
                    let alias = header_key(alias);
                    cells.iter().enumerate().find_map(|(idx, cell)| {
                        (!claimed[idx] && cell_matches(pass, cell, &alias)).then_some(idx)
                    })
                });
                if let Some(idx) = found {
                    claimed[idx] = true;
                    positions.insert(spec.canonical, idx);
                }
            }
        }

        if let Some(missing) = specs
            .iter()
            .find(|s| s.required && !positions.contains_key(s.canonical))
        {
            return Err(AdapterError::MissingColumn {
                column: missing.canonical.to_string(),
                header: cells.join(", "),
            });
        }

        Ok(Self {
            positions,
            width: cells.len(),
        })
    }

    pub fn position(&self, canonical: &str) -> Option<usize> {
        self.positions.get(canonical).copied()
    }

    /// Number of cells in the resolved header.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Raw cell for `canonical`, if the column exists and the row reaches it.
    pub fn get<'r>(&self, row: &'r csv::StringRecord, canonical: &str) -> Option<&'r str> {
        row.get(self.position(canonical)?)
    }
}

fn cell_matches(pass: MatchPass, cell: &str, alias: &str) -> bool {
    if cell.is_empty() || alias.is_empty() {
        return false;
    }
    match pass {
        MatchPass::Exact => cell == alias,
        MatchPass::Contains => cell.contains(alias) || alias.contains(cell),
        MatchPass::Fuzzy => jaro_winkler(cell, alias) >= FUZZY_THRESHOLD,
    }
}

/// Lowercase alphanumerics only, so `ISIN Div Payout/ ISIN Growth` and
/// `ISIN Div Payout/ISIN Growth` compare equal.
fn header_key(cell: &str) -> String {
    cell.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
