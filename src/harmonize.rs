//! Variant harmonization across the validation list, the association files and the LD
//! references of every population.
//!
//! The first population's LD reference fixes the canonical allele orientation and block
//! layout. A variant survives only if every input carries it with compatible alleles.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::Population;
use crate::error::{CsxError, Result};
use crate::io::{index_first, LdReference, RefVariant, SnpInfo, SumstatRecord, ValidationVariant};

/// Smallest p-value used when converting to a z-score.
pub const MIN_P_VALUE: f64 = 1e-323;
/// Per-row sample sizes further than this factor from the run's sample size are reported.
pub const SAMPLE_SIZE_RATIO: f64 = 2.0;

/// Orientation of a pair of alleles relative to a reference pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Same,
    Swapped,
}

impl Orientation {
    pub fn sign(self) -> f64 {
        match self {
            Orientation::Same => 1.0,
            Orientation::Swapped => -1.0,
        }
    }
}

fn complement(allele: &str) -> Option<String> {
    allele
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'A' => Some('T'),
            'T' => Some('A'),
            'C' => Some('G'),
            'G' => Some('C'),
            _ => None,
        })
        .collect()
}

/// Matches `(a1, a2)` against the reference pair `(ref_a1, ref_a2)`. Exact matches win over
/// strand-complemented ones; anything else is incompatible.
pub fn orient(ref_a1: &str, ref_a2: &str, a1: &str, a2: &str) -> Option<Orientation> {
    let eq = |x: &str, y: &str| x.eq_ignore_ascii_case(y);
    if eq(a1, ref_a1) && eq(a2, ref_a2) {
        return Some(Orientation::Same);
    }
    if eq(a1, ref_a2) && eq(a2, ref_a1) {
        return Some(Orientation::Swapped);
    }
    let (c1, c2) = (complement(a1)?, complement(a2)?);
    if eq(&c1, ref_a1) && eq(&c2, ref_a2) {
        Some(Orientation::Same)
    } else if eq(&c1, ref_a2) && eq(&c2, ref_a1) {
        Some(Orientation::Swapped)
    } else {
        None
    }
}

/// Converts a marginal effect and its p-value to a standardized effect,
/// `sign(effect) * |Φ⁻¹(p / 2)| / sqrt(n)`. Rows with `p` outside (0, 1] give `None`.
pub fn standardize_effect(normal: &Normal, effect: f64, p: f64, n: f64) -> Option<f64> {
    if !effect.is_finite() || !(p > 0.0 && p <= 1.0) || !(n > 0.0) {
        return None;
    }
    if effect == 0.0 {
        return Some(0.0);
    }
    let z = normal.inverse_cdf(p.max(MIN_P_VALUE) / 2.0).abs();
    z.is_finite().then(|| effect.signum() * z / n.sqrt())
}

/// Standardized-to-per-allele factor `sqrt(2 f (1 - f))`, or 1 when the frequency is unknown or
/// degenerate.
pub fn allele_scale(maf: Option<f64>) -> f64 {
    match maf {
        Some(f) if f > 0.0 && f < 1.0 => (2.0 * f * (1.0 - f)).sqrt(),
        _ => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub chrom: u8,
    pub id: String,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
}

/// One harmonized LD block: per-population correlation matrices, standardized marginal effects
/// and allele scales over the same ordered set of variants.
#[derive(Debug, Clone)]
pub struct LdBlock {
    /// Index of the block's first variant in the chromosome-wide variant list.
    pub start: usize,
    pub ld: Vec<DMatrix<f64>>,
    pub effects: Vec<DVector<f64>>,
    pub scale: Vec<DVector<f64>>,
}

impl LdBlock {
    /// Builds a block with unit allele scales.
    pub fn new(start: usize, ld: Vec<DMatrix<f64>>, effects: Vec<DVector<f64>>) -> Result<Self> {
        let scale = effects
            .iter()
            .map(|e| DVector::from_element(e.len(), 1.0))
            .collect();
        Self::with_scale(start, ld, effects, scale)
    }

    pub fn with_scale(
        start: usize,
        ld: Vec<DMatrix<f64>>,
        effects: Vec<DVector<f64>>,
        scale: Vec<DVector<f64>>,
    ) -> Result<Self> {
        if ld.is_empty() || ld.len() != effects.len() || ld.len() != scale.len() {
            return Err(CsxError::Config(format!(
                "block at {start}: {} LD matrices, {} effect vectors, {} scale vectors",
                ld.len(),
                effects.len(),
                scale.len()
            )));
        }
        let len = effects[0].len();
        if len == 0 {
            return Err(CsxError::Config(format!("block at {start} is empty")));
        }
        for (k, ((r, e), s)) in ld.iter().zip(&effects).zip(&scale).enumerate() {
            if r.nrows() != len || r.ncols() != len || e.len() != len || s.len() != len {
                return Err(CsxError::Config(format!(
                    "block at {start}, population {k}: expected {len} variants"
                )));
            }
        }
        Ok(Self {
            start,
            ld,
            effects,
            scale,
        })
    }

    pub fn len(&self) -> usize {
        self.effects[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_pops(&self) -> usize {
        self.ld.len()
    }

    pub fn end(&self) -> usize {
        self.start + self.len()
    }
}

fn far_from(row_n: f64, n_gwas: f64) -> bool {
    let ratio = row_n / n_gwas;
    !(ratio.is_finite() && (1.0 / SAMPLE_SIZE_RATIO..=SAMPLE_SIZE_RATIO).contains(&ratio))
}

/// Harmonized view of one chromosome.
#[derive(Debug, Clone)]
pub struct Harmonized {
    pub variants: Vec<Variant>,
    pub blocks: Vec<LdBlock>,
    /// Per population, how many kept variants report a sample size more than
    /// [`SAMPLE_SIZE_RATIO`] times away from the configured one.
    pub sample_size_outliers: Vec<usize>,
}

impl Harmonized {
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// Restricts `reference` to the variants the SNP information table lists on the same chromosome
/// with compatible alleles, and takes minor-allele frequencies from its `FRQ_<pop>` column when
/// present. Blocks left empty are removed. Returns the number of variants removed.
pub fn apply_snp_info(reference: &mut LdReference, info: &SnpInfo, pop: Population) -> usize {
    let chrom = reference.chrom;
    let column = info.frequency_column(pop);
    let mut removed = 0;
    for block in &mut reference.blocks {
        let mut keep = Vec::with_capacity(block.variants.len());
        for (i, v) in block.variants.iter_mut().enumerate() {
            let Some(row) = info.rows.get(&v.id) else {
                continue;
            };
            if row.chrom != chrom || orient(&v.a1, &v.a2, &row.a1, &row.a2).is_none() {
                continue;
            }
            if let Some(f) = column.and_then(|c| row.frq[c]) {
                v.maf = Some(f.min(1.0 - f));
            }
            keep.push(i);
        }
        if keep.len() < block.variants.len() {
            removed += block.variants.len() - keep.len();
            block.ld = block.ld.select_rows(&keep).select_columns(&keep);
            block.variants = keep.iter().map(|&i| block.variants[i].clone()).collect();
        }
    }
    reference.blocks.retain(|b| !b.variants.is_empty());
    removed
}

/// Position of a variant inside a non-canonical reference, with its sign relative to the
/// canonical orientation.
#[derive(Debug, Clone, Copy)]
struct RefHit {
    block: usize,
    row: usize,
    sign: f64,
    maf: Option<f64>,
}

/// A canonical variant that survived every filter.
struct Kept<'a> {
    refs: Vec<RefHit>,
    effects: Vec<f64>,
    variant: &'a RefVariant,
}

#[derive(Debug, Default)]
struct DropCounts {
    validation: usize,
    reference: usize,
    sumstats: usize,
}

/// Aligns one chromosome's inputs into sampler-ready blocks.
///
/// `sumstats`, `n_gwas` and `references` are indexed by population, the first entry providing
/// the canonical reference.
pub fn harmonize(
    chrom: u8,
    validation: &[ValidationVariant],
    sumstats: &[Vec<SumstatRecord>],
    n_gwas: &[f64],
    references: &[LdReference],
) -> Result<Harmonized> {
    let n_pops = references.len();
    if n_pops == 0 || sumstats.len() != n_pops || n_gwas.len() != n_pops {
        return Err(CsxError::Config(format!(
            "harmonize needs matching inputs: {} references, {} association files, {} sample sizes",
            n_pops,
            sumstats.len(),
            n_gwas.len()
        )));
    }
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| CsxError::InvalidParameter(format!("standard normal: {e}")))?;

    let on_chrom: Vec<&ValidationVariant> =
        validation.iter().filter(|v| v.chrom == chrom).collect();
    let (val_index, _) = index_first(&on_chrom, |v| v.id.as_str());
    let sst_index: Vec<HashMap<&str, &SumstatRecord>> = sumstats
        .iter()
        .map(|records| {
            let (index, dups) = index_first(records, |r| r.id.as_str());
            if dups > 0 {
                debug!("chr{chrom}: ignored {dups} duplicate association rows");
            }
            index
        })
        .collect();

    // Other populations' references: id -> (block, row, alleles, maf).
    let mut ref_index: Vec<HashMap<&str, (usize, usize, &RefVariant)>> =
        Vec::with_capacity(n_pops);
    for reference in references {
        let mut index = HashMap::with_capacity(reference.n_variants());
        for (b, block) in reference.blocks.iter().enumerate() {
            for (r, v) in block.variants.iter().enumerate() {
                index.entry(v.id.as_str()).or_insert((b, r, v));
            }
        }
        ref_index.push(index);
    }

    let canonical = &references[0];
    let mut drops = DropCounts::default();
    let mut outliers = vec![0usize; n_pops];
    let mut seen: HashSet<&str> = HashSet::new();
    let mut variants = Vec::new();
    let mut blocks = Vec::new();

    for (b, block) in canonical.blocks.iter().enumerate() {
        let mut kept: Vec<Kept> = Vec::new();
        'variant: for (row, v) in block.variants.iter().enumerate() {
            if !seen.insert(v.id.as_str()) {
                continue;
            }
            let Some(val) = val_index.get(v.id.as_str()) else {
                drops.validation += 1;
                continue;
            };
            if orient(&v.a1, &v.a2, &val.a1, &val.a2).is_none() {
                drops.validation += 1;
                continue;
            }

            let mut refs = Vec::with_capacity(n_pops);
            let mut effects = Vec::with_capacity(n_pops);
            let mut flagged = Vec::with_capacity(n_pops);
            for k in 0..n_pops {
                let hit = if k == 0 {
                    RefHit {
                        block: b,
                        row,
                        sign: 1.0,
                        maf: v.maf,
                    }
                } else {
                    let Some(&(kb, kr, kv)) = ref_index[k].get(v.id.as_str()) else {
                        drops.reference += 1;
                        continue 'variant;
                    };
                    let Some(o) = orient(&v.a1, &v.a2, &kv.a1, &kv.a2) else {
                        drops.reference += 1;
                        continue 'variant;
                    };
                    RefHit {
                        block: kb,
                        row: kr,
                        sign: o.sign(),
                        maf: kv.maf,
                    }
                };

                let Some(rec) = sst_index[k].get(v.id.as_str()) else {
                    drops.sumstats += 1;
                    continue 'variant;
                };
                let Some(o) = orient(&v.a1, &v.a2, &rec.a1, &rec.a2) else {
                    drops.sumstats += 1;
                    continue 'variant;
                };
                let Some(z) = standardize_effect(&normal, rec.effect, rec.p, n_gwas[k]) else {
                    drops.sumstats += 1;
                    continue 'variant;
                };
                refs.push(hit);
                effects.push(o.sign() * z);
                flagged.push(rec.n.is_some_and(|n| far_from(n, n_gwas[k])));
            }
            for (total, far) in outliers.iter_mut().zip(flagged) {
                *total += usize::from(far);
            }
            kept.push(Kept {
                refs,
                effects,
                variant: v,
            });
        }

        if kept.is_empty() {
            continue;
        }
        let start = variants.len();
        let m = kept.len();
        let mut ld = Vec::with_capacity(n_pops);
        let mut eff = Vec::with_capacity(n_pops);
        let mut scale = Vec::with_capacity(n_pops);
        for (k, reference) in references.iter().enumerate() {
            let r = DMatrix::from_fn(m, m, |i, j| {
                let (hi, hj) = (kept[i].refs[k], kept[j].refs[k]);
                if hi.block != hj.block {
                    0.0
                } else {
                    hi.sign * hj.sign * reference.blocks[hi.block].ld[(hi.row, hj.row)]
                }
            });
            ld.push(r);
            eff.push(DVector::from_iterator(m, kept.iter().map(|kv| kv.effects[k])));
            scale.push(DVector::from_iterator(
                m,
                kept.iter().map(|kv| allele_scale(kv.refs[k].maf)),
            ));
        }
        for kv in &kept {
            variants.push(Variant {
                chrom,
                id: kv.variant.id.clone(),
                pos: kv.variant.pos,
                a1: kv.variant.a1.clone(),
                a2: kv.variant.a2.clone(),
            });
        }
        blocks.push(LdBlock::with_scale(start, ld, eff, scale)?);
    }

    info!(
        "chr{chrom}: {} of {} reference variants harmonized in {} blocks \
         (dropped {} validation, {} reference, {} association)",
        variants.len(),
        canonical.n_variants(),
        blocks.len(),
        drops.validation,
        drops.reference,
        drops.sumstats
    );

    Ok(Harmonized {
        variants,
        blocks,
        sample_size_outliers: outliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RefBlock;
    use approx::assert_abs_diff_eq;

    fn rv(id: &str, pos: u64, a1: &str, a2: &str, maf: Option<f64>) -> RefVariant {
        RefVariant {
            id: id.into(),
            pos,
            a1: a1.into(),
            a2: a2.into(),
            maf,
        }
    }

    fn val(id: &str, a1: &str, a2: &str) -> ValidationVariant {
        ValidationVariant {
            chrom: 1,
            id: id.into(),
            pos: 0,
            a1: a1.into(),
            a2: a2.into(),
        }
    }

    fn sst(id: &str, a1: &str, a2: &str, effect: f64) -> SumstatRecord {
        SumstatRecord {
            id: id.into(),
            a1: a1.into(),
            a2: a2.into(),
            effect,
            p: 0.01,
            n: None,
        }
    }

    fn reference(variants: Vec<RefVariant>, ld: DMatrix<f64>) -> LdReference {
        LdReference {
            chrom: 1,
            blocks: vec![RefBlock { variants, ld }],
        }
    }

    #[test]
    fn test_orient() {
        assert_eq!(orient("A", "G", "a", "g"), Some(Orientation::Same));
        assert_eq!(orient("A", "G", "G", "A"), Some(Orientation::Swapped));
        assert_eq!(orient("A", "G", "T", "C"), Some(Orientation::Same));
        assert_eq!(orient("A", "G", "C", "T"), Some(Orientation::Swapped));
        assert_eq!(orient("A", "G", "A", "C"), None);
        assert_eq!(orient("A", "G", "I", "D"), None);
        // Palindromic pairs resolve to the exact match.
        assert_eq!(orient("A", "T", "A", "T"), Some(Orientation::Same));
    }

    #[test]
    fn test_standardize_effect() {
        let normal = Normal::new(0.0, 1.0).unwrap();
        let z = standardize_effect(&normal, 0.3, 0.05, 100.0).unwrap();
        assert_abs_diff_eq!(z, 1.959964 / 10.0, epsilon = 1e-5);
        let z = standardize_effect(&normal, -0.3, 0.05, 100.0).unwrap();
        assert!(z < 0.0);
        assert_eq!(standardize_effect(&normal, 0.0, 0.2, 100.0), Some(0.0));
        let tiny = standardize_effect(&normal, 1.0, 1e-300, 100.0).unwrap();
        assert!(tiny.is_finite() && tiny > 3.0, "got {tiny}");
        assert_eq!(standardize_effect(&normal, f64::NAN, 0.2, 100.0), None);
        assert_eq!(standardize_effect(&normal, 1.0, 1.5, 100.0), None);
        assert_eq!(standardize_effect(&normal, 1.0, 0.0, 100.0), None);
        assert_eq!(standardize_effect(&normal, 1.0, -0.1, 100.0), None);
        let smallest = standardize_effect(&normal, 1.0, 5e-324, 100.0).unwrap();
        assert!(smallest.is_finite());
    }

    #[test]
    fn test_allele_scale() {
        assert_abs_diff_eq!(allele_scale(Some(0.5)), 0.5f64.sqrt(), epsilon = 1e-12);
        assert_eq!(allele_scale(None), 1.0);
        assert_eq!(allele_scale(Some(0.0)), 1.0);
    }

    #[test]
    fn test_single_population_flip_and_drop() {
        let ld = DMatrix::from_row_slice(3, 3, &[1.0, 0.5, 0.2, 0.5, 1.0, 0.1, 0.2, 0.1, 1.0]);
        let refs = vec![reference(
            vec![
                rv("rs1", 10, "A", "G", Some(0.5)),
                rv("rs2", 20, "C", "T", None),
                rv("rs3", 30, "A", "C", None),
            ],
            ld,
        )];
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T"), val("rs3", "A", "C")];
        let sumstats = vec![vec![
            sst("rs1", "G", "A", 0.2),
            sst("rs2", "C", "T", 0.2),
            sst("rs3", "A", "G", 0.2),
        ]];
        let h = harmonize(1, &validation, &sumstats, &[100.0], &refs).unwrap();

        assert_eq!(h.variants.len(), 2);
        assert_eq!(h.variants[0].id, "rs1");
        assert_eq!(h.variants[1].id, "rs2");
        let block = &h.blocks[0];
        assert!(block.effects[0][0] < 0.0, "swapped alleles flip the sign");
        assert!(block.effects[0][1] > 0.0);
        assert_abs_diff_eq!(block.ld[0][(0, 1)], 0.5);
        assert_abs_diff_eq!(block.scale[0][0], 0.5f64.sqrt(), epsilon = 1e-12);
        assert_eq!(block.scale[0][1], 1.0);
    }

    #[test]
    fn test_second_population_resigned() {
        let canonical = reference(
            vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "C", "T", None)],
            DMatrix::from_row_slice(2, 2, &[1.0, 0.4, 0.4, 1.0]),
        );
        // rs2 is stored with swapped alleles in the second reference.
        let other = reference(
            vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "T", "C", None)],
            DMatrix::from_row_slice(2, 2, &[1.0, 0.6, 0.6, 1.0]),
        );
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T")];
        let sumstats = vec![
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
        ];
        let h = harmonize(1, &validation, &sumstats, &[100.0, 50.0], &[canonical, other]).unwrap();
        let block = &h.blocks[0];
        assert_abs_diff_eq!(block.ld[0][(0, 1)], 0.4);
        assert_abs_diff_eq!(block.ld[1][(0, 1)], -0.6);
        assert_abs_diff_eq!(block.ld[1][(1, 1)], 1.0);
        assert!(block.effects[1][1] > 0.0);
    }

    #[test]
    fn test_cross_block_entries_are_zero() {
        let canonical = reference(
            vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "C", "T", None)],
            DMatrix::from_row_slice(2, 2, &[1.0, 0.4, 0.4, 1.0]),
        );
        let other = LdReference {
            chrom: 1,
            blocks: vec![
                RefBlock {
                    variants: vec![rv("rs1", 10, "A", "G", None)],
                    ld: DMatrix::from_element(1, 1, 1.0),
                },
                RefBlock {
                    variants: vec![rv("rs2", 20, "C", "T", None)],
                    ld: DMatrix::from_element(1, 1, 1.0),
                },
            ],
        };
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T")];
        let sumstats = vec![
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
        ];
        let h = harmonize(1, &validation, &sumstats, &[100.0, 50.0], &[canonical, other]).unwrap();
        assert_eq!(h.blocks[0].ld[1][(0, 1)], 0.0);
    }

    #[test]
    fn test_variant_missing_in_one_population_is_dropped() {
        let canonical = reference(
            vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "C", "T", None)],
            DMatrix::identity(2, 2),
        );
        let other = reference(vec![rv("rs1", 10, "A", "G", None)], DMatrix::identity(1, 1));
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T")];
        let sumstats = vec![
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
            vec![sst("rs1", "A", "G", 0.1), sst("rs2", "C", "T", 0.1)],
        ];
        let h = harmonize(1, &validation, &sumstats, &[100.0, 50.0], &[canonical, other]).unwrap();
        assert_eq!(h.variants.len(), 1);
        assert_eq!(h.blocks[0].len(), 1);
    }

    #[test]
    fn test_zero_overlap_and_duplicates() {
        let refs = vec![reference(
            vec![rv("rs1", 10, "A", "G", None)],
            DMatrix::identity(1, 1),
        )];
        let empty = harmonize(1, &[val("rs9", "A", "G")], &[vec![]], &[100.0], &refs).unwrap();
        assert!(empty.is_empty());
        assert!(empty.blocks.is_empty());

        let sumstats = vec![vec![sst("rs1", "A", "G", 0.1), sst("rs1", "A", "G", -0.1)]];
        let h = harmonize(1, &[val("rs1", "A", "G")], &sumstats, &[100.0], &refs).unwrap();
        assert_eq!(h.variants.len(), 1);
        assert!(h.blocks[0].effects[0][0] > 0.0, "first duplicate wins");
    }

    #[test]
    fn test_zero_p_value_row_is_dropped() {
        let refs = vec![reference(
            vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "C", "T", None)],
            DMatrix::identity(2, 2),
        )];
        let mut zero_p = sst("rs2", "C", "T", 0.1);
        zero_p.p = 0.0;
        let sumstats = vec![vec![sst("rs1", "A", "G", 0.1), zero_p]];
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T")];
        let h = harmonize(1, &validation, &sumstats, &[100.0], &refs).unwrap();
        assert_eq!(h.variants.len(), 1);
        assert_eq!(h.variants[0].id, "rs1");
    }

    #[test]
    fn test_reference_duplicate_emitted_once() {
        let canonical = LdReference {
            chrom: 1,
            blocks: vec![
                RefBlock {
                    variants: vec![rv("rs1", 10, "A", "G", None), rv("rs2", 20, "C", "T", None)],
                    ld: DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 1.0]),
                },
                RefBlock {
                    variants: vec![rv("rs1", 10, "A", "G", None), rv("rs3", 30, "A", "C", None)],
                    ld: DMatrix::identity(2, 2),
                },
            ],
        };
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T"), val("rs3", "A", "C")];
        let sumstats = vec![vec![
            sst("rs1", "A", "G", 0.1),
            sst("rs2", "C", "T", 0.1),
            sst("rs3", "A", "C", 0.1),
        ]];
        let h = harmonize(1, &validation, &sumstats, &[100.0], &[canonical]).unwrap();
        let ids: Vec<&str> = h.variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["rs1", "rs2", "rs3"]);
        assert_eq!(h.blocks.len(), 2);
        assert_eq!(h.blocks[0].len(), 2);
        assert_eq!(h.blocks[1].len(), 1);
        assert_eq!(h.blocks[1].start, 2);
    }

    #[test]
    fn test_sample_size_outliers_counted() {
        let refs = vec![reference(
            vec![
                rv("rs1", 10, "A", "G", None),
                rv("rs2", 20, "C", "T", None),
                rv("rs3", 30, "A", "C", None),
            ],
            DMatrix::identity(3, 3),
        )];
        let mut rows = vec![
            sst("rs1", "A", "G", 0.1),
            sst("rs2", "C", "T", 0.1),
            sst("rs3", "A", "C", 0.1),
        ];
        rows[0].n = Some(1000.0);
        rows[1].n = Some(150.0);
        let validation = vec![val("rs1", "A", "G"), val("rs2", "C", "T"), val("rs3", "A", "C")];
        let h = harmonize(1, &validation, &[rows], &[100.0], &refs).unwrap();
        assert_eq!(h.sample_size_outliers, vec![1]);
    }

    #[test]
    fn test_apply_snp_info() {
        use crate::io::SnpInfoRow;

        let row = |chrom: u8, a1: &str, a2: &str, frq: Vec<Option<f64>>| SnpInfoRow {
            chrom,
            pos: 0,
            a1: a1.into(),
            a2: a2.into(),
            frq,
        };
        let info = SnpInfo {
            pops: vec![Population::Eur, Population::Eas],
            rows: [
                ("rs1".to_string(), row(1, "G", "A", vec![Some(0.8), Some(0.1)])),
                ("rs3".to_string(), row(1, "A", "C", vec![None, Some(0.4)])),
                ("rs4".to_string(), row(2, "A", "G", vec![Some(0.5), Some(0.5)])),
                ("rs5".to_string(), row(1, "A", "C", vec![Some(0.5), Some(0.5)])),
            ]
            .into_iter()
            .collect(),
        };
        let mut reference = LdReference {
            chrom: 1,
            blocks: vec![
                RefBlock {
                    variants: vec![
                        rv("rs1", 10, "A", "G", None),
                        rv("rs2", 20, "C", "T", Some(0.3)),
                        rv("rs3", 30, "A", "C", Some(0.3)),
                    ],
                    ld: DMatrix::from_row_slice(
                        3,
                        3,
                        &[1.0, 0.1, 0.2, 0.1, 1.0, 0.3, 0.2, 0.3, 1.0],
                    ),
                },
                RefBlock {
                    // rs4 sits on another chromosome, rs5 has incompatible alleles.
                    variants: vec![rv("rs4", 40, "A", "G", None), rv("rs5", 50, "A", "G", None)],
                    ld: DMatrix::identity(2, 2),
                },
            ],
        };

        let removed = apply_snp_info(&mut reference, &info, Population::Eur);
        assert_eq!(removed, 3);
        assert_eq!(reference.blocks.len(), 1);
        let block = &reference.blocks[0];
        let ids: Vec<&str> = block.variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["rs1", "rs3"]);
        assert_eq!(block.ld, DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 1.0]));
        assert_abs_diff_eq!(block.variants[0].maf.unwrap(), 0.2, epsilon = 1e-12);
        // No EUR frequency for rs3, so the panel's own value stays.
        assert_eq!(block.variants[1].maf, Some(0.3));
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        assert!(harmonize(1, &[], &[vec![]], &[1.0, 2.0], &[]).is_err());
    }

    #[test]
    fn test_block_shape_validation() {
        let ok = LdBlock::new(
            0,
            vec![DMatrix::identity(2, 2)],
            vec![DVector::from_vec(vec![0.1, 0.2])],
        );
        assert!(ok.is_ok());
        let bad = LdBlock::new(
            0,
            vec![DMatrix::identity(3, 3)],
            vec![DVector::from_vec(vec![0.1, 0.2])],
        );
        assert!(bad.is_err());
    }
}
