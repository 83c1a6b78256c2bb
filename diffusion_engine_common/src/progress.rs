//! Aggregated download/load progress across the sub-models of one pipeline.
//!
//! Every sub-model owns a fixed slice of [`PROGRESS_UNITS_PER_MODEL`] units, so the caller sees
//! one counter climbing from `0` to `total_models * PROGRESS_UNITS_PER_MODEL` however many files
//! each sub-model is split into.

use std::{collections::BTreeMap, sync::Arc};

use indicatif::{ProgressBar, ProgressStyle};

pub const PROGRESS_UNITS_PER_MODEL: u64 = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FileStat {
    pub downloaded: u64,
    pub total: u64,
    pub rate: f64,
}

impl FileStat {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.downloaded > 0 { 1.0 } else { 0.0 };
        }
        (self.downloaded as f64 / self.total as f64).min(1.0)
    }

    fn finalize(&mut self) {
        if self.total == 0 {
            self.total = self.downloaded;
        }
        self.downloaded = self.total;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub model_index: usize,
    pub model_name: String,
    pub total_models: usize,
    /// `None` for model-level events (switching to a new model).
    pub filename: Option<String>,
    pub file: FileStat,
    pub progress: u64,
    pub max_progress: u64,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Terminal progress bar fed by tracker events.
pub struct ProgressBarSink(ProgressBar);

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:>16} [{elapsed_precise}] [{wide_bar}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        Self(bar)
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn report(&self, event: &ProgressEvent) {
        self.0.set_length(event.max_progress);
        self.0.set_position(event.progress);
        self.0.set_message(event.model_name.clone());
        if event.max_progress > 0 && event.progress >= event.max_progress {
            self.0.finish();
        }
    }
}

pub struct ProgressTracker {
    total_models: usize,
    model_index: usize,
    model_name: Option<String>,
    /// Files of the model currently loading, keyed `model/filename`.
    active: BTreeMap<String, FileStat>,
    /// Files of models already finished, snapped to 100%.
    completed: BTreeMap<String, FileStat>,
    last_progress: u64,
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl ProgressTracker {
    pub fn new(total_models: usize) -> Self {
        Self {
            total_models,
            model_index: 0,
            model_name: None,
            active: BTreeMap::new(),
            completed: BTreeMap::new(),
            last_progress: 0,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn total_models(&self) -> usize {
        self.total_models
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn max_progress(&self) -> u64 {
        self.total_models as u64 * PROGRESS_UNITS_PER_MODEL
    }

    pub fn progress(&self) -> u64 {
        self.last_progress
    }

    /// Switch to sub-model `model_index`.
    ///
    /// The previous model's files are snapped to 100%, reported, then moved out of the active set
    /// so they no longer weigh on the average of the model that follows.
    pub fn initialize(&mut self, model_index: usize, model_name: &str) {
        self.complete_current();

        self.model_index = model_index;
        self.model_name = Some(model_name.to_string());
        let floor = (model_index as u64 * PROGRESS_UNITS_PER_MODEL).min(self.max_progress());
        self.last_progress = self.last_progress.max(floor);
        self.emit(None, FileStat::default());
    }

    /// Mark the whole load as done: the current model is completed and the counter reaches
    /// [`ProgressTracker::max_progress`], also when the last sub-model needed no download.
    pub fn finish(&mut self) {
        self.complete_current();
        self.last_progress = self.max_progress();
        self.emit(None, FileStat::default());
    }

    fn complete_current(&mut self) {
        let Some(name) = self.model_name.clone() else {
            return;
        };
        let done = (self.model_index as u64 + 1) * PROGRESS_UNITS_PER_MODEL;
        self.last_progress = self.last_progress.max(done.min(self.max_progress()));

        let prefix = format!("{name}/");
        let finished = std::mem::take(&mut self.active);
        for (key, mut stat) in finished {
            stat.finalize();
            let filename = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
            self.completed.insert(key, stat);
            self.emit(Some(filename), stat);
        }
    }

    /// Record byte progress for one file of the current model and report the aggregate.
    pub fn update(&mut self, filename: &str, downloaded: u64, total: u64, rate: f64) {
        let key = self.key(filename);
        let stat = self.active.entry(key).or_default();
        stat.total = stat.total.max(total);
        stat.downloaded = stat.downloaded.max(downloaded);
        stat.rate = rate;
        let stat = *stat;

        let average = self.active.values().map(FileStat::fraction).sum::<f64>()
            / self.active.len() as f64;
        let base = self.model_index as u64 * PROGRESS_UNITS_PER_MODEL;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let current = base + (average * PROGRESS_UNITS_PER_MODEL as f64).floor() as u64;
        self.last_progress = self.last_progress.max(current.min(self.max_progress()));
        self.emit(Some(filename.to_string()), stat);
    }

    /// Forget every model and file, keeping the expected model count.
    pub fn clear(&mut self) {
        self.model_index = 0;
        self.model_name = None;
        self.active.clear();
        self.completed.clear();
        self.last_progress = 0;
    }

    /// Clear and change the expected model count.
    pub fn reset(&mut self, total_models: usize) {
        self.clear();
        self.total_models = total_models;
    }

    /// Stats for `model/filename`, from either the active or the completed set.
    pub fn file_stat(&self, model_name: &str, filename: &str) -> Option<FileStat> {
        let key = format!("{model_name}/{filename}");
        self.active
            .get(&key)
            .or_else(|| self.completed.get(&key))
            .copied()
    }

    /// Keys (`model/filename`) contributing to the current model's average.
    pub fn active_files(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    fn key(&self, filename: &str) -> String {
        format!("{}/{filename}", self.model_name.as_deref().unwrap_or_default())
    }

    fn emit(&self, filename: Option<String>, file: FileStat) {
        if self.sinks.is_empty() {
            return;
        }
        let event = ProgressEvent {
            model_index: self.model_index,
            model_name: self.model_name.clone().unwrap_or_default(),
            total_models: self.total_models,
            filename,
            file,
            progress: self.last_progress,
            max_progress: self.max_progress(),
        };
        for sink in &self.sinks {
            sink.report(&event);
        }
    }
}
