//! Slides (image + label map + per-label counts) and the design table
//! that lists them.
//!
//! A slide file is a safetensors archive with
//!
//! * `image` - (3, H, W), f32 in `[-1, 1]` or u8 in `[0, 255]`
//! * `label` - (H, W), integer label per pixel, `0` for background
//! * `counts` - (L, G), row `i` holds the counts of label `i + 1`
//!   (optional; slides without counts can still be imputed)
//!
//! The design table is a TSV file with columns `name`, `file` and one
//! column per categorical covariate. An optional `validation` column
//! names a second archive whose `label` tensor marks held-out spots
//! (same label ids as the count rows).

use crate::common_io::{read_lines, read_tsv};
use crate::count_model::{num_effects, Covariate};

use anyhow::{anyhow, bail};
use candle_util::candle_core::{safetensors, DType, Device, Tensor};
use candle_util::candle_inference::ExecContext;
use candle_util::candle_label_pooling::num_labels;
use log::info;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// floor of the per-gene baseline so that its log stays finite
const MIN_GENE_BASELINE: f32 = 1e-3;

/// design columns that are not covariates
const NAME_COLUMN: &str = "name";
const FILE_COLUMN: &str = "file";
const VALIDATION_COLUMN: &str = "validation";

#[derive(Clone, Debug)]
pub struct SlideData {
    pub name: Box<str>,
    /// (3, H, W)
    pub image: Tensor,
    /// (H, W), u32
    pub label: Tensor,
    /// (L, G) for labels `1..=L`
    pub counts: Option<Tensor>,
    /// (1, E) one-hot covariate design
    pub effects: Option<Tensor>,
}

impl SlideData {
    /// Check shapes and convert to the canonical dtypes
    pub fn new(
        name: &str,
        image: Tensor,
        label: Tensor,
        counts: Option<Tensor>,
        effects: Option<Tensor>,
    ) -> anyhow::Result<Self> {
        let (cc, hh, ww) = image.dims3()?;
        if cc != 3 {
            bail!("slide {}: image must have 3 channels, found {}", name, cc);
        }
        let image = if image.dtype() == DType::U8 {
            image.to_dtype(DType::F32)?.affine(1. / 127.5, -1.)?
        } else {
            image.to_dtype(DType::F32)?
        };

        let (lh, lw) = label.dims2()?;
        if (lh, lw) != (hh, ww) {
            bail!(
                "slide {}: label map is {}x{} but the image is {}x{}",
                name,
                lh,
                lw,
                hh,
                ww
            );
        }
        let label = label.to_dtype(DType::U32)?;

        let counts = match counts {
            Some(c) => {
                let (nl, _) = c.dims2()?;
                let max_label = num_labels(&label)? - 1;
                if max_label > nl {
                    bail!(
                        "slide {}: label {} has no row in the count matrix ({} rows)",
                        name,
                        max_label,
                        nl
                    );
                }
                Some(c.to_dtype(DType::F32)?)
            }
            None => None,
        };

        let effects = match effects {
            Some(e) => Some(e.to_dtype(DType::F32)?.reshape((1, ()))?),
            None => None,
        };

        Ok(Self {
            name: name.into(),
            image,
            label,
            counts,
            effects,
        })
    }

    /// Load a slide archive onto the CPU
    pub fn from_safetensors(
        name: &str,
        file: &str,
        effects: Option<Tensor>,
    ) -> anyhow::Result<Self> {
        let mut tensors = safetensors::load(file, &Device::Cpu)
            .map_err(|e| anyhow!("slide {}: failed to read {}: {}", name, file, e))?;

        let image = tensors
            .remove("image")
            .ok_or(anyhow!("slide {}: no `image` tensor in {}", name, file))?;
        let label = tensors
            .remove("label")
            .ok_or(anyhow!("slide {}: no `label` tensor in {}", name, file))?;
        let counts = tensors.remove("counts");

        Self::new(name, image, label, counts, effects)
    }

    /// Write the slide in the archive format read by `from_safetensors`
    pub fn save_safetensors(&self, file: &str) -> anyhow::Result<()> {
        let mut tensors = vec![("image", self.image.clone()), ("label", self.label.clone())];
        if let Some(c) = &self.counts {
            tensors.push(("counts", c.clone()));
        }
        safetensors::save(
            &tensors.into_iter().collect::<std::collections::HashMap<_, _>>(),
            file,
        )?;
        Ok(())
    }

    pub fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            image: self.image.to_device(device)?,
            label: self.label.to_device(device)?,
            counts: match &self.counts {
                Some(c) => Some(c.to_device(device)?),
                None => None,
            },
            effects: match &self.effects {
                Some(e) => Some(e.to_device(device)?),
                None => None,
            },
        })
    }

    pub fn height(&self) -> anyhow::Result<usize> {
        Ok(self.label.dim(0)?)
    }

    pub fn width(&self) -> anyhow::Result<usize> {
        Ok(self.label.dim(1)?)
    }

    /// number of non-background labels (count rows when present)
    pub fn num_spots(&self) -> anyhow::Result<usize> {
        match &self.counts {
            Some(c) => Ok(c.dim(0)?),
            None => Ok(num_labels(&self.label)? - 1),
        }
    }

    /// sorted labels that cover at least one pixel
    pub fn spot_ids(&self) -> anyhow::Result<Vec<u32>> {
        let present: BTreeSet<u32> = self
            .label
            .flatten_all()?
            .to_device(&Device::Cpu)?
            .to_vec1::<u32>()?
            .into_iter()
            .filter(|&l| l > 0)
            .collect();
        Ok(present.into_iter().collect())
    }

    /// The same slide seen through another label map
    pub fn with_label(&self, label: Tensor) -> anyhow::Result<Self> {
        let label = label.to_device(self.image.device())?;
        let slide = Self::new(
            &self.name,
            self.image.clone(),
            label,
            self.counts.clone(),
            self.effects.clone(),
        )?;
        slide.to_device(self.image.device())
    }

    /// number of non-background pixels
    pub fn num_foreground_pixels(&self) -> anyhow::Result<usize> {
        Ok(self
            .label
            .gt(0u32)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as usize)
    }
}

/// A minibatch of slides drawn from a dataset of `dataset_size`
pub struct SlideBatch {
    pub slides: Vec<SlideData>,
    pub dataset_size: usize,
}

impl SlideBatch {
    pub fn new(slides: Vec<SlideData>, dataset_size: usize) -> Self {
        Self {
            slides,
            dataset_size,
        }
    }

    /// `dataset_size / len(batch)`, the weight of minibatch
    /// log-likelihoods and local complexity costs
    pub fn batch_fraction(&self) -> f64 {
        self.dataset_size as f64 / self.slides.len().max(1) as f64
    }

    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }
}

//////////////////
// design table //
//////////////////

#[derive(Clone, Debug)]
pub struct DesignEntry {
    pub name: Box<str>,
    pub file: Box<str>,
    /// archive with the `label` map of held-out spots
    pub validation: Option<Box<str>>,
    /// (covariate, category) pairs
    pub covariates: Vec<(Box<str>, Box<str>)>,
}

pub struct SlideDesign {
    pub entries: Vec<DesignEntry>,
}

impl SlideDesign {
    /// Read the design table; relative slide paths are resolved
    /// against the table's directory
    pub fn from_tsv(file: &str) -> anyhow::Result<Self> {
        let table = read_tsv(file)?;
        let name_col = table
            .column(NAME_COLUMN)
            .ok_or(anyhow!("{}: missing `{}` column", file, NAME_COLUMN))?;
        let file_col = table
            .column(FILE_COLUMN)
            .ok_or(anyhow!("{}: missing `{}` column", file, FILE_COLUMN))?;
        let validation_col = table.column(VALIDATION_COLUMN);

        let base = Path::new(file).parent().unwrap_or(Path::new(""));
        let resolve = |p: &str| -> PathBuf {
            let path = Path::new(p);
            if path.is_relative() {
                base.join(path)
            } else {
                path.to_path_buf()
            }
        };

        let entries = table
            .rows
            .iter()
            .map(|row| {
                let validation = validation_col
                    .map(|j| row[j].trim())
                    .filter(|v| !v.is_empty())
                    .map(|v| resolve(v).to_string_lossy().into());
                let covariates = table
                    .header
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != name_col && j != file_col && Some(j) != validation_col)
                    .map(|(j, h)| (h.clone(), row[j].clone()))
                    .collect();
                DesignEntry {
                    name: row[name_col].clone(),
                    file: resolve(row[file_col].as_ref()).to_string_lossy().into(),
                    validation,
                    covariates,
                }
            })
            .collect();

        Ok(Self { entries })
    }

    /// Covariate schema: one group per covariate column with its
    /// categories in sorted order
    pub fn covariates(&self) -> Vec<Covariate> {
        let names: Vec<Box<str>> = match self.entries.first() {
            Some(e) => e.covariates.iter().map(|(k, _)| k.clone()).collect(),
            None => vec![],
        };
        names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let categories: BTreeSet<Box<str>> = self
                    .entries
                    .iter()
                    .map(|e| e.covariates[j].1.clone())
                    .collect();
                Covariate {
                    name: name.clone(),
                    categories: categories.into_iter().collect(),
                }
            })
            .collect()
    }

    /// Load all slides in parallel and move them to `ctx.device`
    pub fn load_slides(
        &self,
        schema: &[Covariate],
        ctx: &ExecContext,
    ) -> anyhow::Result<Vec<SlideData>> {
        let slides = self
            .entries
            .par_iter()
            .map(|entry| {
                let effects = if schema.is_empty() {
                    None
                } else {
                    let row = effects_row(schema, &entry.covariates)?;
                    let ne = row.len();
                    Some(Tensor::from_vec(row, (1, ne), &Device::Cpu)?)
                };
                SlideData::from_safetensors(&entry.name, &entry.file, effects)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!("loaded {} slides", slides.len());
        slides.iter().map(|s| s.to_device(&ctx.device)).collect()
    }

    /// Slides of the entries with a `validation` archive, labelled by
    /// their held-out spots
    pub fn load_validation_slides(
        &self,
        schema: &[Covariate],
        ctx: &ExecContext,
    ) -> anyhow::Result<Vec<SlideData>> {
        let held_out: Vec<&DesignEntry> = self
            .entries
            .iter()
            .filter(|e| e.validation.is_some())
            .collect();
        if held_out.is_empty() {
            return Ok(vec![]);
        }

        let slides = SlideDesign {
            entries: held_out.iter().map(|&e| e.clone()).collect(),
        }
        .load_slides(schema, ctx)?;

        slides
            .iter()
            .zip(held_out.iter())
            .map(|(slide, entry)| {
                let file = entry.validation.as_deref().unwrap_or_default();
                let label = safetensors::load(file, &Device::Cpu)
                    .map_err(|e| anyhow!("slide {}: failed to read {}: {}", slide.name, file, e))?
                    .remove("label")
                    .ok_or(anyhow!("slide {}: no `label` tensor in {}", slide.name, file))?;
                slide.with_label(label)
            })
            .collect()
    }
}

/// One-hot encode the categories of a slide, groups concatenated in
/// schema order
pub fn effects_row(
    schema: &[Covariate],
    values: &[(Box<str>, Box<str>)],
) -> anyhow::Result<Vec<f32>> {
    let mut row = vec![0f32; num_effects(schema)];
    let mut offset = 0;
    for cov in schema {
        let value = values
            .iter()
            .find(|(k, _)| *k == cov.name)
            .map(|(_, v)| v)
            .ok_or(anyhow!("no value for covariate `{}`", cov.name))?;
        let pos = cov
            .categories
            .iter()
            .position(|c| c == value)
            .ok_or(anyhow!(
                "unknown category `{}` for covariate `{}`",
                value,
                cov.name
            ))?;
        row[offset + pos] = 1.0;
        offset += cov.categories.len();
    }
    Ok(row)
}

/// Gene names, one per line (first word)
pub fn read_genes(file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let genes: Vec<Box<str>> = read_lines(file)?
        .iter()
        .filter_map(|l| l.split_whitespace().next().map(Box::from))
        .collect();
    if genes.is_empty() {
        bail!("{} lists no genes", file);
    }
    Ok(genes)
}

/// Mean count per gene over every spot of every slide with counts
pub fn gene_baseline(slides: &[SlideData]) -> anyhow::Result<Vec<f32>> {
    let mut total: Option<Tensor> = None;
    let mut nspots = 0;
    for counts in slides.iter().filter_map(|s| s.counts.as_ref()) {
        nspots += counts.dim(0)?;
        let sum_g = counts.sum(0)?;
        total = Some(match total {
            Some(acc) => (acc + sum_g)?,
            None => sum_g,
        });
    }
    let total = total.ok_or(anyhow!("no slide carries counts"))?;
    Ok(total
        .to_device(&Device::Cpu)?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|x| (x / nspots.max(1) as f32).max(MIN_GENE_BASELINE))
        .collect())
}

/// Average number of pixels per labelled spot
pub fn spot_size(slides: &[SlideData]) -> anyhow::Result<f32> {
    let mut npixels = 0;
    let mut nspots = 0;
    for s in slides {
        npixels += s.num_foreground_pixels()?;
        nspots += s.num_spots()?;
    }
    if nspots == 0 {
        bail!("no labelled spots");
    }
    Ok(npixels as f32 / nspots as f32)
}
