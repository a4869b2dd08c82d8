use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Stages reported while a run moves through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Emission,
    Aggregation,
    Join,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Emission => "posterior draw emission",
            Self::Aggregation => "per-row aggregation",
            Self::Join => "design join",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress, counted in chunks.
pub trait ChunkProgressObserver: Send {
    fn on_stage_start(&mut self, stage: PipelineStage, total_chunks: usize) {
        let _ = (stage, total_chunks);
    }
    fn on_chunk_done(&mut self, stage: PipelineStage, completed_chunks: usize) {
        let _ = (stage, completed_chunks);
    }
    fn on_stage_finish(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ChunkProgressObserver for NoopProgress {}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Terminal progress bars, one per stage. Hidden when stderr is not a terminal.
#[derive(Default)]
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkProgressObserver for ProgressBarObserver {
    fn on_stage_start(&mut self, stage: PipelineStage, total_chunks: usize) {
        if let Some(previous) = self.bar.take() {
            previous.finish_and_clear();
        }
        self.bar = Some(create_progress_bar(total_chunks as u64, stage.describe()));
    }

    fn on_chunk_done(&mut self, _stage: PipelineStage, completed_chunks: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_chunks as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: PipelineStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        events: Vec<(PipelineStage, usize)>,
    }

    impl ChunkProgressObserver for Recording {
        fn on_chunk_done(&mut self, stage: PipelineStage, completed_chunks: usize) {
            self.events.push((stage, completed_chunks));
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let mut observer = Recording::default();
        observer.on_stage_start(PipelineStage::Emission, 3);
        observer.on_chunk_done(PipelineStage::Emission, 1);
        observer.on_stage_finish(PipelineStage::Emission);
        assert_eq!(observer.events, vec![(PipelineStage::Emission, 1)]);
    }

    #[test]
    fn stages_describe_themselves() {
        assert_eq!(PipelineStage::Join.to_string(), "design join");
    }

    #[test]
    fn hidden_bars_accept_updates() {
        let mut observer = ProgressBarObserver::new();
        observer.on_stage_start(PipelineStage::Aggregation, 2);
        observer.on_chunk_done(PipelineStage::Aggregation, 2);
        observer.on_stage_finish(PipelineStage::Aggregation);
        assert!(observer.bar.is_none());
    }
}
