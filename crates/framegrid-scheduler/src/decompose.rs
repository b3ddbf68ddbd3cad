//! Job decomposition and render-time estimation.
//!
//! A job's frame range is cut into contiguous chunks, one task per chunk.
//! Multi-chunk video renders get a final encoding task that depends on
//! every chunk and stitches them together.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use framegrid_state::{
    ClusterId, FrameRange, JobId, ProjectId, RenderQuality, RenderSettings, RenderTask,
    TaskId, TaskMetadata, TaskPriority, TaskRequirements, TaskStatus, TaskType,
};

use crate::error::{SchedulerError, SchedulerResult};

const FULL_HD_PIXELS: f64 = 1920.0 * 1080.0;

/// Most frames a single request may cover.
pub const MAX_FRAMES: u64 = 1_000_000;

/// Most tasks a job may be split into.
pub const MAX_TASKS_PER_JOB: u64 = 10_000;

/// A client request to render a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    pub frame_range: FrameRange,
    #[serde(default)]
    pub settings: RenderSettings,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// Overrides the scheduler's default retry budget.
    pub max_retries: Option<u32>,
    pub target_cluster: Option<ClusterId>,
}

impl JobRequest {
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        task_type: TaskType,
        frame_range: FrameRange,
    ) -> Self {
        Self {
            name: name.into(),
            project_id: project_id.into(),
            task_type,
            priority: TaskPriority::default(),
            frame_range,
            settings: RenderSettings::default(),
            requirements: TaskRequirements::default(),
            metadata: TaskMetadata::default(),
            max_retries: None,
            target_cluster: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        validate_shape(&self.frame_range, &self.settings)
    }
}

/// A loose task submitted outside of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub project_id: ProjectId,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    pub frame_range: FrameRange,
    #[serde(default)]
    pub settings: RenderSettings,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub max_retries: Option<u32>,
    pub target_cluster: Option<ClusterId>,
    /// Skips the built-in estimate when the caller knows better.
    pub estimated_duration_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(project_id: impl Into<String>, task_type: TaskType, frame_range: FrameRange) -> Self {
        Self {
            project_id: project_id.into(),
            task_type,
            priority: TaskPriority::default(),
            frame_range,
            settings: RenderSettings::default(),
            requirements: TaskRequirements::default(),
            dependencies: Vec::new(),
            metadata: TaskMetadata::default(),
            max_retries: None,
            target_cluster: None,
            estimated_duration_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        validate_shape(&self.frame_range, &self.settings)
    }
}

fn validate_shape(range: &FrameRange, settings: &RenderSettings) -> SchedulerResult<()> {
    if range.end < range.start {
        return Err(SchedulerError::InvalidRequest(format!(
            "empty frame range {}..={}",
            range.start, range.end
        )));
    }
    let frames = (range.end - range.start).checked_add(1).ok_or_else(|| {
        SchedulerError::InvalidRequest(format!(
            "frame range {}..={} is too large",
            range.start, range.end
        ))
    })?;
    if frames > MAX_FRAMES {
        return Err(SchedulerError::InvalidRequest(format!(
            "frame range covers {frames} frames, at most {MAX_FRAMES} are allowed"
        )));
    }
    if settings.fps == 0 {
        return Err(SchedulerError::InvalidRequest("fps must be positive".to_string()));
    }
    Ok(())
}

fn quality_factor(quality: RenderQuality) -> f64 {
    match quality {
        RenderQuality::Draft => 0.5,
        RenderQuality::Standard => 1.0,
        RenderQuality::High => 1.5,
        RenderQuality::Ultra => 2.5,
    }
}

/// Splits jobs into tasks and estimates their render time.
#[derive(Debug, Clone)]
pub struct Decomposer {
    /// Frames per chunk; zero keeps the whole range in one task.
    pub chunk_frames: u64,
    /// Render time of one 1080p standard-quality frame.
    pub ms_per_frame: u64,
    pub default_max_retries: u32,
}

impl Default for Decomposer {
    fn default() -> Self {
        Self {
            chunk_frames: 300,
            ms_per_frame: 100,
            default_max_retries: 3,
        }
    }
}

impl Decomposer {
    /// Estimated render time for `frames` frames.
    pub fn estimate_duration_ms(&self, frames: u64, settings: &RenderSettings, complexity: f64) -> u64 {
        let resolution = (settings.resolution.pixels() as f64 / FULL_HD_PIXELS).max(0.25);
        let effects = 1.0 + 0.1 * settings.effects.len() as f64;
        let estimate = frames as f64
            * self.ms_per_frame as f64
            * resolution
            * quality_factor(settings.quality)
            * effects
            * complexity.max(0.1);
        estimate.round() as u64
    }

    /// Number of chunks `range` is split into.
    pub fn chunk_count(&self, range: FrameRange) -> u64 {
        let frames = range.total_frames();
        if frames == 0 || self.chunk_frames == 0 {
            frames.min(1)
        } else {
            frames.div_ceil(self.chunk_frames)
        }
    }

    /// Reject jobs that would split into more than `MAX_TASKS_PER_JOB` tasks.
    pub fn check_job(&self, request: &JobRequest) -> SchedulerResult<()> {
        let chunks = self.chunk_count(request.frame_range);
        if chunks > MAX_TASKS_PER_JOB {
            return Err(SchedulerError::InvalidRequest(format!(
                "job would split into {chunks} tasks, at most {MAX_TASKS_PER_JOB} are allowed"
            )));
        }
        Ok(())
    }

    /// Contiguous chunks covering `range`, the last one possibly shorter.
    pub fn chunks(&self, range: FrameRange) -> Vec<FrameRange> {
        if range.end < range.start {
            return Vec::new();
        }
        if self.chunk_frames == 0 {
            return vec![range];
        }
        let mut chunks = Vec::new();
        let mut start = range.start;
        loop {
            let end = start.saturating_add(self.chunk_frames - 1).min(range.end);
            chunks.push(FrameRange { start, end });
            if end >= range.end {
                break;
            }
            start = end + 1;
        }
        chunks
    }

    /// Build the tasks of a job. The caller has validated the request.
    pub fn decompose(&self, request: &JobRequest, job_id: &JobId, now: u64) -> Vec<RenderTask> {
        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        let mut tasks: Vec<RenderTask> = self
            .chunks(request.frame_range)
            .into_iter()
            .map(|range| {
                let estimate = self.estimate_duration_ms(
                    range.total_frames(),
                    &request.settings,
                    request.metadata.complexity,
                );
                RenderTask {
                    id: Uuid::new_v4().to_string(),
                    job_id: job_id.clone(),
                    project_id: request.project_id.clone(),
                    task_type: request.task_type,
                    priority: request.priority,
                    status: TaskStatus::Pending,
                    frame_range: range,
                    settings: request.settings.clone(),
                    requirements: request.requirements.clone(),
                    target_cluster: request.target_cluster.clone(),
                    assigned_node: None,
                    assigned_cluster: None,
                    progress: 0.0,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                    estimated_duration_ms: estimate,
                    actual_duration_ms: None,
                    retry_count: 0,
                    max_retries,
                    dependencies: Vec::new(),
                    outputs: Vec::new(),
                    metadata: request.metadata.clone(),
                    error: None,
                    cost: 0.0,
                }
            })
            .collect();

        if request.task_type == TaskType::VideoRender && tasks.len() > 1 {
            let encode = self.encoding_task(request, &tasks, max_retries);
            tasks.push(encode);
        }
        tasks
    }

    fn encoding_task(&self, request: &JobRequest, chunks: &[RenderTask], max_retries: u32) -> RenderTask {
        let render_ms = chunks
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.estimated_duration_ms));
        let requirements = TaskRequirements {
            required_codecs: vec![request.settings.codec.clone()],
            preferred_regions: request.requirements.preferred_regions.clone(),
            ..TaskRequirements::default()
        };
        let template = &chunks[0];
        RenderTask {
            id: Uuid::new_v4().to_string(),
            task_type: TaskType::Encoding,
            frame_range: request.frame_range,
            requirements,
            estimated_duration_ms: render_ms / 10,
            max_retries,
            dependencies: chunks.iter().map(|t| t.id.clone()).collect(),
            ..template.clone()
        }
    }

    /// Build a loose task for the implicit job `job_id`.
    pub fn single_task(&self, request: &TaskRequest, job_id: &JobId, now: u64) -> RenderTask {
        let estimate = request.estimated_duration_ms.unwrap_or_else(|| {
            self.estimate_duration_ms(
                request.frame_range.total_frames(),
                &request.settings,
                request.metadata.complexity,
            )
        });
        RenderTask {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.clone(),
            project_id: request.project_id.clone(),
            task_type: request.task_type,
            priority: request.priority,
            status: TaskStatus::Pending,
            frame_range: request.frame_range,
            settings: request.settings.clone(),
            requirements: request.requirements.clone(),
            target_cluster: request.target_cluster.clone(),
            assigned_node: None,
            assigned_cluster: None,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_duration_ms: estimate,
            actual_duration_ms: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.default_max_retries),
            dependencies: request.dependencies.clone(),
            outputs: Vec::new(),
            metadata: request.metadata.clone(),
            error: None,
            cost: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrid_state::Resolution;

    #[test]
    fn baseline_estimate_is_100ms_per_frame() {
        let d = Decomposer::default();
        assert_eq!(d.estimate_duration_ms(300, &RenderSettings::default(), 1.0), 30_000);
    }

    #[test]
    fn estimate_scales_with_settings() {
        let d = Decomposer::default();
        let uhd_ultra = RenderSettings {
            resolution: Resolution::UHD,
            quality: RenderQuality::Ultra,
            effects: vec!["blur".to_string(), "glow".to_string()],
            ..RenderSettings::default()
        };
        // 10 frames * 100ms * 4 (uhd) * 2.5 (ultra) * 1.2 (effects) * 2 (complexity)
        assert_eq!(d.estimate_duration_ms(10, &uhd_ultra, 2.0), 24_000);

        let tiny = RenderSettings {
            resolution: Resolution { width: 320, height: 240 },
            quality: RenderQuality::Draft,
            ..RenderSettings::default()
        };
        // Resolution factor floors at 0.25; complexity floors at 0.1.
        assert_eq!(d.estimate_duration_ms(100, &tiny, 0.0), 125);
    }

    #[test]
    fn chunks_cover_range_exactly() {
        let d = Decomposer {
            chunk_frames: 100,
            ..Decomposer::default()
        };
        let chunks = d.chunks(FrameRange { start: 10, end: 259 });
        assert_eq!(
            chunks,
            vec![
                FrameRange { start: 10, end: 109 },
                FrameRange { start: 110, end: 209 },
                FrameRange { start: 210, end: 259 },
            ]
        );
        assert_eq!(d.chunks(FrameRange { start: 5, end: 5 }).len(), 1);
        assert!(d.chunks(FrameRange { start: 5, end: 4 }).is_empty());
    }

    #[test]
    fn request_frame_bounds() {
        let at = |start, end| TaskRequest::new("p", TaskType::SlideRender, FrameRange { start, end });
        assert!(at(0, u64::MAX).validate().is_err());
        assert!(at(1, u64::MAX).validate().is_err());
        assert!(at(0, MAX_FRAMES).validate().is_err());
        assert!(at(0, MAX_FRAMES - 1).validate().is_ok());
        assert!(at(u64::MAX, u64::MAX).validate().is_ok());
    }

    #[test]
    fn job_task_count_is_capped() {
        let d = Decomposer {
            chunk_frames: 10,
            ..Decomposer::default()
        };
        let fits = JobRequest::new("j", "p", TaskType::SlideRender, FrameRange { start: 0, end: 99_999 });
        assert_eq!(d.chunk_count(fits.frame_range), MAX_TASKS_PER_JOB);
        assert!(d.check_job(&fits).is_ok());

        let too_many = JobRequest::new("j", "p", TaskType::SlideRender, FrameRange { start: 0, end: 100_000 });
        assert_eq!(d.chunk_count(too_many.frame_range), MAX_TASKS_PER_JOB + 1);
        assert!(d.check_job(&too_many).is_err());

        let whole = Decomposer {
            chunk_frames: 0,
            ..Decomposer::default()
        };
        assert_eq!(whole.chunk_count(too_many.frame_range), 1);
    }

    #[test]
    fn zero_chunk_size_keeps_one_task() {
        let d = Decomposer {
            chunk_frames: 0,
            ..Decomposer::default()
        };
        assert_eq!(d.chunks(FrameRange { start: 0, end: 9999 }).len(), 1);
    }

    #[test]
    fn video_render_gets_encoding_task() {
        let d = Decomposer::default();
        let req = JobRequest::new("intro", "proj", TaskType::VideoRender, FrameRange { start: 0, end: 899 });
        let tasks = d.decompose(&req, &"job-1".to_string(), 42);

        assert_eq!(tasks.len(), 4);
        let encode = &tasks[3];
        assert_eq!(encode.task_type, TaskType::Encoding);
        assert_eq!(encode.dependencies.len(), 3);
        assert!(tasks[..3].iter().all(|t| encode.dependencies.contains(&t.id)));
        assert_eq!(encode.requirements.required_codecs, vec!["h264".to_string()]);
        assert_eq!(encode.estimated_duration_ms, 9_000);
        assert!(tasks.iter().all(|t| t.job_id == "job-1" && t.created_at == 42));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn single_chunk_and_slide_jobs_have_no_encoding_task() {
        let d = Decomposer::default();
        let short = JobRequest::new("s", "p", TaskType::VideoRender, FrameRange { start: 0, end: 99 });
        assert_eq!(d.decompose(&short, &"j".to_string(), 0).len(), 1);

        let slides = JobRequest::new("s", "p", TaskType::SlideRender, FrameRange { start: 0, end: 899 });
        let tasks = d.decompose(&slides, &"j".to_string(), 0);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::SlideRender));
    }

    #[test]
    fn job_retry_budget_overrides_default() {
        let d = Decomposer::default();
        let mut req = JobRequest::new("s", "p", TaskType::SlideRender, FrameRange { start: 0, end: 9 });
        req.max_retries = Some(7);
        assert_eq!(d.decompose(&req, &"j".to_string(), 0)[0].max_retries, 7);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let empty = TaskRequest::new("p", TaskType::SlideRender, FrameRange { start: 10, end: 9 });
        assert!(matches!(empty.validate(), Err(SchedulerError::InvalidRequest(_))));

        let mut no_fps = JobRequest::new("j", "p", TaskType::SlideRender, FrameRange { start: 0, end: 9 });
        no_fps.settings.fps = 0;
        assert!(matches!(no_fps.validate(), Err(SchedulerError::InvalidRequest(_))));
    }
}
