//! Picking genes by name or pattern, and ranking them within the
//! expression profile of each factor.

use anyhow::{anyhow, bail};
use candle_util::candle_core::{Device, Tensor};
use regex::Regex;

/// Indexes of the genes named by `queries`.
///
/// With `regex` every query is a case-insensitive pattern and all
/// genes matching any of them are selected, in vocabulary order.
/// Otherwise queries are exact gene names, kept in query order.
/// No queries select every gene.
pub fn select_genes(
    genes: &[Box<str>],
    queries: &[Box<str>],
    regex: bool,
) -> anyhow::Result<Vec<usize>> {
    if queries.is_empty() {
        return Ok((0..genes.len()).collect());
    }

    if !regex {
        return queries
            .iter()
            .map(|q| {
                genes
                    .iter()
                    .position(|g| g == q)
                    .ok_or(anyhow!("unknown gene `{}`", q))
            })
            .collect();
    }

    let patterns = queries
        .iter()
        .map(|q| {
            Regex::new(&format!("(?i){}", q))
                .map_err(|e| anyhow!("invalid gene pattern `{}`: {}", q, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let selected: Vec<usize> = genes
        .iter()
        .enumerate()
        .filter(|(_, g)| patterns.iter().any(|re| re.is_match(g)))
        .map(|(j, _)| j)
        .collect();

    if selected.is_empty() {
        bail!("no gene matches {:?}", queries);
    }
    Ok(selected)
}

/// One gene of a factor's ranked profile
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileEntry {
    pub factor: usize,
    pub gene: Box<str>,
    pub rate: f32,
}

/// Rank the candidate genes of each factor by decreasing rate
///
/// # Arguments
/// * `genes` - gene vocabulary, the rows of `rate_gk`
/// * `rate_gk` - gene by factor rates
/// * `factor_ids` - factor id of every column of `rate_gk`
/// * `factors` - factors to report (all if empty)
/// * `gene_idx` - candidate genes
/// * `truncate` - number of top genes kept per factor (all if `None`)
pub fn rank_profiles(
    genes: &[Box<str>],
    rate_gk: &Tensor,
    factor_ids: &[usize],
    factors: &[usize],
    gene_idx: &[usize],
    truncate: Option<usize>,
) -> anyhow::Result<Vec<ProfileEntry>> {
    let rate_gk: Vec<Vec<f32>> = rate_gk.to_device(&Device::Cpu)?.to_vec2()?;
    if rate_gk.len() != genes.len() {
        bail!(
            "rate matrix has {} rows but there are {} genes",
            rate_gk.len(),
            genes.len()
        );
    }
    if let Some(&g) = gene_idx.iter().find(|&&g| g >= genes.len()) {
        bail!("gene index {} is out of range ({} genes)", g, genes.len());
    }

    let columns: Vec<(usize, usize)> = if factors.is_empty() {
        factor_ids.iter().copied().enumerate().collect()
    } else {
        factors
            .iter()
            .map(|k| {
                factor_ids
                    .iter()
                    .position(|id| id == k)
                    .map(|col| (col, *k))
                    .ok_or(anyhow!("factor {} is not active", k))
            })
            .collect::<anyhow::Result<_>>()?
    };

    let mut entries = vec![];
    for (col, id) in columns {
        let mut ranked: Vec<(usize, f32)> = gene_idx.iter().map(|&g| (g, rate_gk[g][col])).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        if let Some(n) = truncate {
            ranked.truncate(n);
        }
        entries.extend(ranked.into_iter().map(|(g, rate)| ProfileEntry {
            factor: id,
            gene: genes[g].clone(),
            rate,
        }));
    }
    Ok(entries)
}
