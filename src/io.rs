/*!
# Input readers and weight-file writer

Reads the input sources of a run (PLINK `.bim` validation list, per-population association
files, per-population block LD references and the shared `snpinfo_mult_1kg_hm3` table) into plain
records, and writes posterior-mean weight files.

Weight files are tab-delimited, carry no header, and have the fixed column order
`chromosome, variant id, position, effect allele, effect`, so files from several chromosomes can
be concatenated directly.
*/

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use log::{debug, warn};
use nalgebra::DMatrix;

use crate::config::Population;
use crate::error::{CsxError, Result};

/// One row of the validation variant list.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationVariant {
    pub chrom: u8,
    pub id: String,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
}

/// One row of an association file. `effect` is on the log-odds scale when the file reports
/// odds ratios.
#[derive(Debug, Clone, PartialEq)]
pub struct SumstatRecord {
    pub id: String,
    pub a1: String,
    pub a2: String,
    pub effect: f64,
    pub p: f64,
    pub n: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefVariant {
    pub id: String,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
    pub maf: Option<f64>,
}

/// One LD block of a reference panel.
#[derive(Debug, Clone, PartialEq)]
pub struct RefBlock {
    pub variants: Vec<RefVariant>,
    pub ld: DMatrix<f64>,
}

/// Block LD reference of one population for one chromosome.
#[derive(Debug, Clone, PartialEq)]
pub struct LdReference {
    pub chrom: u8,
    pub blocks: Vec<RefBlock>,
}

impl LdReference {
    pub fn n_variants(&self) -> usize {
        self.blocks.iter().map(|b| b.variants.len()).sum()
    }
}

/// One row of the multi-population SNP information table.
#[derive(Debug, Clone, PartialEq)]
pub struct SnpInfoRow {
    pub chrom: u8,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
    /// A1 frequency per population, aligned with [`SnpInfo::pops`].
    pub frq: Vec<Option<f64>>,
}

/// Reference SNP list shared by every population's LD panel, keyed by identifier.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnpInfo {
    /// Populations with an `FRQ_<pop>` column, in column order.
    pub pops: Vec<Population>,
    pub rows: HashMap<String, SnpInfoRow>,
}

impl SnpInfo {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column of `pop` in every row's `frq`.
    pub fn frequency_column(&self, pop: Population) -> Option<usize> {
        self.pops.iter().position(|p| *p == pop)
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightRow<'a> {
    pub chrom: u8,
    pub id: &'a str,
    pub pos: u64,
    pub a1: &'a str,
    pub effect: f64,
}

pub fn bim_path(prefix: &Path) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(".bim");
    PathBuf::from(os)
}

/// Name of the SNP information table at the root of a reference directory.
pub const SNP_INFO_FILE: &str = "snpinfo_mult_1kg_hm3";

pub fn snp_info_path(ref_dir: &Path) -> PathBuf {
    ref_dir.join(SNP_INFO_FILE)
}

/// `<ref_dir>/ldblk_1kg_<pop>/chr<chrom>.txt`
pub fn ld_reference_path(ref_dir: &Path, pop: Population, chrom: u8) -> PathBuf {
    ref_dir
        .join(format!("ldblk_1kg_{}", pop.code().to_ascii_lowercase()))
        .join(format!("chr{chrom}.txt"))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| CsxError::io(path, e))
}

/// Accepts `1`, `chr1` and `CHR1`.
fn parse_chrom(raw: &str) -> Option<u8> {
    let trimmed = raw
        .strip_prefix("chr")
        .or_else(|| raw.strip_prefix("CHR"))
        .unwrap_or(raw);
    trimmed.parse().ok()
}

/// Reads a PLINK `.bim` file (CHR SNP CM BP A1 A2, no header). Rows on chromosomes that are not
/// numeric autosomes are skipped.
pub fn read_validation(path: &Path) -> Result<Vec<ValidationVariant>> {
    let reader = open(path)?;
    let mut out = Vec::new();
    let mut skipped = 0usize;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CsxError::io(path, e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 6 {
            return Err(CsxError::parse(
                path,
                idx + 1,
                format!("expected 6 columns, found {}", fields.len()),
            ));
        }
        let Some(chrom) = parse_chrom(fields[0]) else {
            skipped += 1;
            continue;
        };
        let pos = fields[3]
            .parse()
            .map_err(|_| CsxError::parse(path, idx + 1, format!("invalid position '{}'", fields[3])))?;
        out.push(ValidationVariant {
            chrom,
            id: fields[1].to_string(),
            pos,
            a1: fields[4].to_ascii_uppercase(),
            a2: fields[5].to_ascii_uppercase(),
        });
    }
    if skipped > 0 {
        debug!("{}: skipped {skipped} non-autosomal rows", path.display());
    }
    Ok(out)
}

/// Column positions of an association file header.
#[derive(Debug, Clone, Copy)]
struct SumstatColumns {
    id: usize,
    a1: usize,
    a2: usize,
    effect: usize,
    odds_ratio: bool,
    p: usize,
    n: Option<usize>,
    width: usize,
}

impl SumstatColumns {
    fn from_header(path: &Path, header: &[&str]) -> Result<Self> {
        let upper: Vec<String> = header.iter().map(|h| h.trim().to_ascii_uppercase()).collect();
        let find = |names: &[&str]| upper.iter().position(|h| names.contains(&h.as_str()));
        let require = |names: &[&str]| {
            find(names).ok_or_else(|| {
                CsxError::parse(path, 1, format!("missing required column {}", names[0]))
            })
        };

        let (effect, odds_ratio) = match (find(&["BETA"]), find(&["OR"])) {
            (Some(i), _) => (i, false),
            (None, Some(i)) => (i, true),
            (None, None) => {
                return Err(CsxError::parse(path, 1, "missing effect column BETA or OR"));
            }
        };

        Ok(Self {
            id: require(&["SNP", "RSID", "ID"])?,
            a1: require(&["A1"])?,
            a2: require(&["A2"])?,
            effect,
            odds_ratio,
            p: require(&["P", "PVAL", "P_VALUE"])?,
            n: find(&["N"]),
            width: upper.len(),
        })
    }

    /// `Ok(None)` for rows whose numeric fields are missing or malformed.
    fn parse_row(&self, path: &Path, line: usize, fields: &[&str]) -> Result<Option<SumstatRecord>> {
        if fields.len() < self.width {
            return Err(CsxError::parse(
                path,
                line,
                format!("expected {} columns, found {}", self.width, fields.len()),
            ));
        }
        let (Ok(raw_effect), Ok(p)) = (
            fields[self.effect].trim().parse::<f64>(),
            fields[self.p].trim().parse::<f64>(),
        ) else {
            return Ok(None);
        };
        let effect = if self.odds_ratio {
            raw_effect.ln()
        } else {
            raw_effect
        };
        Ok(Some(SumstatRecord {
            id: fields[self.id].trim().to_string(),
            a1: fields[self.a1].trim().to_ascii_uppercase(),
            a2: fields[self.a2].trim().to_ascii_uppercase(),
            effect,
            p,
            n: self.n.and_then(|i| fields[i].trim().parse().ok()),
        }))
    }
}

/// Reads an association file with a header row. Tab-delimited files go through the `csv`
/// reader; anything else is split on runs of whitespace.
pub fn read_sumstats(path: &Path) -> Result<Vec<SumstatRecord>> {
    let mut reader = open(path)?;
    let mut header = String::new();
    reader
        .read_line(&mut header)
        .map_err(|e| CsxError::io(path, e))?;
    if header.trim().is_empty() {
        return Err(CsxError::parse(path, 1, "empty association file"));
    }

    let mut records = Vec::new();
    let mut malformed = 0usize;
    let mut keep = |parsed: Option<SumstatRecord>| match parsed {
        Some(rec) => records.push(rec),
        None => malformed += 1,
    };

    if header.contains('\t') {
        let mut rdr = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_reader(open(path)?);
        let head = rdr.headers()?.clone();
        let cols = SumstatColumns::from_header(path, &head.iter().collect::<Vec<_>>())?;
        for (idx, row) in rdr.records().enumerate() {
            let row = row?;
            let fields: Vec<&str> = row.iter().collect();
            if fields.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            keep(cols.parse_row(path, idx + 2, &fields)?);
        }
    } else {
        let cols =
            SumstatColumns::from_header(path, &header.split_whitespace().collect::<Vec<_>>())?;
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| CsxError::io(path, e))?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            keep(cols.parse_row(path, idx + 2, &fields)?);
        }
    }

    if malformed > 0 {
        warn!(
            "{}: dropped {malformed} rows with missing or non-numeric effect/p-value",
            path.display()
        );
    }
    Ok(records)
}

/// Reads the SNP information table: a whitespace-delimited header with `CHR SNP BP A1 A2`,
/// followed by any number of `FRQ_<pop>` columns. Other columns (such as `FLP_<pop>`) are
/// ignored. Frequencies written as `NA` are kept as missing; the first row of a duplicated
/// identifier wins.
pub fn read_snp_info(path: &Path) -> Result<SnpInfo> {
    let reader = open(path)?;
    let mut lines = reader.lines().enumerate();
    let header = loop {
        match lines.next() {
            Some((_, line)) => {
                let line = line.map_err(|e| CsxError::io(path, e))?;
                if !line.trim().is_empty() {
                    break line;
                }
            }
            None => return Err(CsxError::parse(path, 1, "empty SNP information table")),
        }
    };
    let upper: Vec<String> = header
        .split_whitespace()
        .map(|h| h.to_ascii_uppercase())
        .collect();
    let require = |name: &str| {
        upper
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| CsxError::parse(path, 1, format!("missing required column {name}")))
    };
    let (chrom_col, id_col, pos_col, a1_col, a2_col) =
        (require("CHR")?, require("SNP")?, require("BP")?, require("A1")?, require("A2")?);
    let (pops, frq_cols): (Vec<Population>, Vec<usize>) = upper
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            let pop = h.strip_prefix("FRQ_")?.parse::<Population>().ok()?;
            Some((pop, i))
        })
        .unzip();

    let mut rows = HashMap::new();
    let mut dups = 0usize;
    for (idx, line) in lines {
        let line = line.map_err(|e| CsxError::io(path, e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < upper.len() {
            return Err(CsxError::parse(
                path,
                idx + 1,
                format!("expected {} columns, found {}", upper.len(), fields.len()),
            ));
        }
        let chrom = parse_chrom(fields[chrom_col]).ok_or_else(|| {
            CsxError::parse(path, idx + 1, format!("invalid chromosome '{}'", fields[chrom_col]))
        })?;
        let pos = fields[pos_col].parse().map_err(|_| {
            CsxError::parse(path, idx + 1, format!("invalid position '{}'", fields[pos_col]))
        })?;
        let frq = frq_cols
            .iter()
            .map(|&c| match fields[c] {
                "NA" | "nan" | "NaN" => Ok(None),
                raw => raw.parse::<f64>().map(Some).map_err(|_| {
                    CsxError::parse(path, idx + 1, format!("invalid frequency '{raw}'"))
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        match rows.entry(fields[id_col].to_string()) {
            Entry::Occupied(_) => dups += 1,
            Entry::Vacant(slot) => {
                slot.insert(SnpInfoRow {
                    chrom,
                    pos,
                    a1: fields[a1_col].to_ascii_uppercase(),
                    a2: fields[a2_col].to_ascii_uppercase(),
                    frq,
                });
            }
        }
    }
    if dups > 0 {
        debug!("{}: ignored {dups} duplicate SNP rows", path.display());
    }
    Ok(SnpInfo { pops, rows })
}

/// Reads a text block LD reference.
///
/// ```text
/// BLOCK 2
/// rs1 1000 A G 0.21
/// rs2 1500 C T 0.35
/// 1.0 0.4
/// 0.4 1.0
/// ```
///
/// Blank lines and lines starting with `#` are ignored. The MAF column is optional.
pub fn read_ld_reference(path: &Path, chrom: u8) -> Result<LdReference> {
    let reader = open(path)?;
    let mut lines = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CsxError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push((idx + 1, trimmed.to_string()));
    }

    let mut blocks = Vec::new();
    let mut cursor = lines.iter();
    while let Some((line_no, header)) = cursor.next() {
        let size = match header.split_whitespace().collect::<Vec<_>>()[..] {
            ["BLOCK", n] => n
                .parse::<usize>()
                .map_err(|_| CsxError::parse(path, *line_no, format!("invalid block size '{n}'")))?,
            _ => {
                return Err(CsxError::parse(
                    path,
                    *line_no,
                    format!("expected 'BLOCK <n>', found '{header}'"),
                ))
            }
        };

        let mut variants = Vec::with_capacity(size);
        for _ in 0..size {
            let (ln, row) = cursor
                .next()
                .ok_or_else(|| CsxError::parse(path, *line_no, "truncated block variant list"))?;
            variants.push(parse_ref_variant(path, *ln, row)?);
        }

        let mut ld = DMatrix::<f64>::zeros(size, size);
        for i in 0..size {
            let (ln, row) = cursor
                .next()
                .ok_or_else(|| CsxError::parse(path, *line_no, "truncated block LD matrix"))?;
            let values: Vec<&str> = row.split_whitespace().collect();
            if values.len() != size {
                return Err(CsxError::parse(
                    path,
                    *ln,
                    format!("expected {size} correlations, found {}", values.len()),
                ));
            }
            for (j, v) in values.iter().enumerate() {
                ld[(i, j)] = v
                    .parse()
                    .map_err(|_| CsxError::parse(path, *ln, format!("invalid correlation '{v}'")))?;
            }
        }
        blocks.push(RefBlock { variants, ld });
    }

    Ok(LdReference { chrom, blocks })
}

fn parse_ref_variant(path: &Path, line: usize, row: &str) -> Result<RefVariant> {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if !(4..=5).contains(&fields.len()) {
        return Err(CsxError::parse(
            path,
            line,
            format!("expected 'SNP BP A1 A2 [MAF]', found {} columns", fields.len()),
        ));
    }
    let pos = fields[1]
        .parse()
        .map_err(|_| CsxError::parse(path, line, format!("invalid position '{}'", fields[1])))?;
    let maf = match fields.get(4) {
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|_| CsxError::parse(path, line, format!("invalid MAF '{raw}'")))?,
        ),
        None => None,
    };
    Ok(RefVariant {
        id: fields[0].to_string(),
        pos,
        a1: fields[2].to_ascii_uppercase(),
        a2: fields[3].to_ascii_uppercase(),
        maf,
    })
}

/// Writes one weight file. An empty row set produces an empty file.
pub fn write_weights<'a, I>(path: &Path, rows: I) -> Result<()>
where
    I: IntoIterator<Item = WeightRow<'a>>,
{
    let file = File::create(path).map_err(|e| CsxError::io(path, e))?;
    let mut wtr = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .from_writer(BufWriter::new(file));
    for row in rows {
        wtr.write_record([
            row.chrom.to_string(),
            row.id.to_string(),
            row.pos.to_string(),
            row.a1.to_string(),
            format!("{:.6e}", row.effect),
        ])?;
    }
    let mut inner = wtr
        .into_inner()
        .map_err(|e| CsxError::io(path, e.into_error()))?;
    inner.flush().map_err(|e| CsxError::io(path, e))?;
    Ok(())
}

/// Keeps the first record per key and reports how many duplicates were dropped.
pub(crate) fn index_first<'a, T, F>(items: &'a [T], key: F) -> (HashMap<&'a str, &'a T>, usize)
where
    F: Fn(&'a T) -> &'a str,
{
    let mut map = HashMap::with_capacity(items.len());
    let mut dups = 0usize;
    for item in items {
        match map.entry(key(item)) {
            Entry::Occupied(_) => dups += 1,
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }
    (map, dups)
}
