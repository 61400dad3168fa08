use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::TemplateError;
use crate::processing::classifier::{LabelTemplate, Templates};
use crate::processing::events::{ChannelDict, Label, UnitKey};
use crate::processing::psth::BinConfig;
use crate::processing::trial::controller::ShamPair;
use crate::processing::trial::TrialRecord;

/// Binning and task identity a template was built under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub post_time: u32,
    pub bin_size: u32,
    #[serde(default)]
    pub task: String,
    /// Caller metadata, kept opaque.
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, Value>,
}

impl TemplateInfo {
    /// Fails unless binning and task tag match the running session exactly.
    pub fn check_compatible(&self, bins: &BinConfig, task: &str) -> Result<(), TemplateError> {
        if self.post_time != bins.post_time_ms {
            return Err(TemplateError::Incompatible {
                field: "post_time",
                expected: bins.post_time_ms.to_string(),
                found: self.post_time.to_string(),
            });
        }
        if self.bin_size != bins.bin_size_ms {
            return Err(TemplateError::Incompatible {
                field: "bin_size",
                expected: bins.bin_size_ms.to_string(),
                found: self.bin_size.to_string(),
            });
        }
        if self.task != task {
            return Err(TemplateError::Incompatible {
                field: "task",
                expected: task.to_string(),
                found: self.task.clone(),
            });
        }
        Ok(())
    }
}

// TEMPLATE FILE ---------------------------------------------------------------

/// On-disk template set with provenance.
///
/// Serialised as one JSON object: numeric keys hold a label's vectors, every
/// other key is fixed-name metadata. A label's vectors are either keyed by
/// unit or concatenated into one flat array in `ChannelDict` order; saving
/// always writes the keyed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTemplateFile", into = "RawTemplateFile")]
pub struct TemplateFile {
    pub templates: Templates,
    pub actual_events: Vec<Label>,
    pub predicted_events: Vec<Label>,
    pub channel_dict: ChannelDict,
    pub info: TemplateInfo,
    pub tilts: Vec<TrialRecord>,
}

#[derive(Serialize, Deserialize)]
struct RawTemplateFile {
    #[serde(rename = "ActualEvents", default)]
    actual_events: Vec<Label>,
    #[serde(rename = "PredictedEvents", default)]
    predicted_events: Vec<Label>,
    #[serde(rename = "ChannelDict", default)]
    channel_dict: ChannelDict,
    info: TemplateInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tilts: Vec<TrialRecord>,
    #[serde(flatten)]
    templates: BTreeMap<String, RawLabelTemplate>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLabelTemplate {
    PerUnit(BTreeMap<String, Vec<f64>>),
    Flat(Vec<f64>),
}

/// Cuts a flat label array into one `bins_n` chunk per monitored unit.
fn split_flat(
    label: Label,
    values: &[f64],
    channels: &ChannelDict,
    info: &TemplateInfo,
) -> Result<LabelTemplate, TemplateError> {
    let keys: Vec<UnitKey> = channels
        .iter()
        .flat_map(|(&channel, units)| units.iter().map(move |&unit| UnitKey::new(channel, unit)))
        .collect();
    let bins_n = match info.bin_size {
        0 => 0,
        size => (info.post_time / size) as usize,
    };
    if bins_n == 0 || keys.is_empty() || values.len() != keys.len() * bins_n {
        return Err(TemplateError::FlatLength {
            label,
            units: keys.len(),
            bins_n,
            found: values.len(),
        });
    }
    Ok(keys
        .into_iter()
        .zip(values.chunks(bins_n))
        .map(|(key, chunk)| (key, chunk.to_vec()))
        .collect())
}

impl TryFrom<RawTemplateFile> for TemplateFile {
    type Error = TemplateError;

    fn try_from(raw: RawTemplateFile) -> Result<Self, Self::Error> {
        if raw.actual_events.len() != raw.predicted_events.len() {
            return Err(TemplateError::UnpairedEvents {
                actual: raw.actual_events.len(),
                predicted: raw.predicted_events.len(),
            });
        }

        let mut templates = Templates::new();
        for (label, stored) in raw.templates {
            let label: Label = label
                .parse()
                .map_err(|_| TemplateError::InvalidLabel(label.clone()))?;
            let template = match stored {
                RawLabelTemplate::PerUnit(units) => {
                    let mut template = LabelTemplate::new();
                    for (key, vector) in units {
                        template.insert(key.parse()?, vector);
                    }
                    template
                }
                RawLabelTemplate::Flat(values) => split_flat(label, &values, &raw.channel_dict, &raw.info)?,
            };
            templates.insert(label, template);
        }

        Ok(TemplateFile {
            templates,
            actual_events: raw.actual_events,
            predicted_events: raw.predicted_events,
            channel_dict: raw.channel_dict,
            info: raw.info,
            tilts: raw.tilts,
        })
    }
}

impl From<TemplateFile> for RawTemplateFile {
    fn from(file: TemplateFile) -> Self {
        RawTemplateFile {
            actual_events: file.actual_events,
            predicted_events: file.predicted_events,
            channel_dict: file.channel_dict,
            info: file.info,
            tilts: file.tilts,
            templates: file
                .templates
                .into_iter()
                .map(|(label, units)| {
                    let units = units
                        .into_iter()
                        .map(|(key, vector)| (key.to_string(), vector))
                        .collect();
                    (label.to_string(), RawLabelTemplate::PerUnit(units))
                })
                .collect(),
        }
    }
}

impl TemplateFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawTemplateFile = serde_json::from_reader(BufReader::new(file))?;
        raw.try_into()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TemplateError> {
        let path = path.as_ref();
        let io_err = |source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(io_err)?;
        info!("template saved to {}", path.display());
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, TemplateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, TemplateError> {
        let raw: RawTemplateFile = serde_json::from_str(json)?;
        raw.try_into()
    }

    /// Checks compatibility with the running session and every vector's length.
    pub fn validated(self, bins: &BinConfig, task: &str) -> Result<Self, TemplateError> {
        self.info.check_compatible(bins, task)?;
        let expected = bins.bins_n();
        for (&label, template) in &self.templates {
            for (key, vector) in template {
                if vector.len() != expected {
                    return Err(TemplateError::VectorLength {
                        label,
                        key: key.to_string(),
                        expected,
                        found: vector.len(),
                    });
                }
            }
        }
        Ok(self)
    }

    /// Rewrites every label reference through `relabel`.
    pub fn relabel(mut self, relabel: &Relabel) -> Result<Self, TemplateError> {
        if relabel.is_identity() {
            return Ok(self);
        }

        let mut templates = Templates::new();
        for (label, template) in self.templates {
            templates.insert(relabel.apply(label)?, template);
        }
        self.templates = templates;

        self.actual_events = relabel.apply_all(&self.actual_events)?;
        self.predicted_events = relabel.apply_all(&self.predicted_events)?;

        for record in &mut self.tilts {
            record.label = relabel.apply(record.label)?;
            if let Some(predicted) = record.predicted_label {
                record.predicted_label = Some(relabel.apply(predicted)?);
            }
            for (label, _) in &mut record.distances {
                *label = relabel.apply(*label)?;
            }
        }
        Ok(self)
    }

    /// Recorded decisions, in trial order, for sham replay.
    pub fn sham_pairs(&self) -> Vec<ShamPair> {
        self.predicted_events
            .iter()
            .zip(&self.actual_events)
            .map(|(&predicted, &actual)| ShamPair { predicted, actual })
            .collect()
    }
}

/// Loads a template file, checks it against the session and applies the remap.
pub fn load_for_session<P: AsRef<Path>>(
    path: P,
    bins: &BinConfig,
    task: &str,
    relabel: &Relabel,
) -> Result<TemplateFile, TemplateError> {
    let file = TemplateFile::load(&path)?
        .validated(bins, task)?
        .relabel(relabel)?;
    info!(
        "loaded template {} ({} labels, {} recorded decisions)",
        path.as_ref().display(),
        file.templates.len(),
        file.actual_events.len()
    );
    Ok(file)
}

// RELABEL ---------------------------------------------------------------------

/// Injective map from template labels to session labels.
///
/// An empty map is the identity; otherwise every label met must be mapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relabel {
    map: BTreeMap<Label, Label>,
}

impl Relabel {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new(map: BTreeMap<Label, Label>) -> Result<Self, TemplateError> {
        let mut targets: BTreeMap<Label, Label> = BTreeMap::new();
        for (&source, &target) in &map {
            if let Some(&first) = targets.get(&target) {
                return Err(TemplateError::NotInjective {
                    first,
                    second: source,
                    target,
                });
            }
            targets.insert(target, source);
        }
        Ok(Self { map })
    }

    pub fn is_identity(&self) -> bool {
        self.map.is_empty()
    }

    pub fn apply(&self, label: Label) -> Result<Label, TemplateError> {
        if self.is_identity() {
            return Ok(label);
        }
        self.map
            .get(&label)
            .copied()
            .ok_or(TemplateError::Unmapped(label))
    }

    fn apply_all(&self, labels: &[Label]) -> Result<Vec<Label>, TemplateError> {
        labels.iter().map(|&label| self.apply(label)).collect()
    }
}
