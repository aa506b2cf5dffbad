//! Rebuild orchestration: pattern load, tile, mosaic, projection, composite.
//!
//! Every rebuild takes a [`RebuildTicket`] from a generation counter. Newer
//! tickets supersede older ones; a superseded rebuild stops at its next
//! checkpoint and never publishes.

use crate::asset_cache::AssetCache;
use crate::catalog::Rgb8;
use crate::compositor::{composite, CompositeResult};
use crate::error::{Notice, PipelineError};
use crate::export::{encode_png, export_file_name, write_atomic};
use crate::pattern::{
    load_pattern, pattern_cache, LoadedPattern, PatternDocument, RegionColorMap, RegionId,
};
use crate::projection::{BackendConfig, LightingControls, Projector};
use crate::room::LoadedRoom;
use crate::tiling::{
    build_texture, tile_point_to_document, Rotation, Texture, ViewMode, DEFAULT_REPEAT,
    TILE_RASTER_SIZE,
};
use sha2::{Digest, Sha256};
use smol::channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const TEXTURE_CACHE_VERSION: u8 = 1;
const TEXTURE_MEMO_LIMIT: usize = 16;

fn debug_timing_enabled() -> bool {
    matches!(
        std::env::var("MOSAICO_DEBUG_TIMING").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a preview depends on besides the room.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildParams {
    pub pattern_source: String,
    pub colors: RegionColorMap,
    pub default_color: Rgb8,
    pub rotation: Rotation,
    pub repeat: u32,
    /// Overrides the backend's calibrated lighting when set.
    pub lighting: Option<LightingControls>,
    /// Overrides the room's shadow intensity when set.
    pub shadow_intensity: Option<f32>,
}

impl RebuildParams {
    pub fn new(pattern_source: &str, default_color: Rgb8) -> Self {
        Self {
            pattern_source: pattern_source.to_string(),
            colors: RegionColorMap::new(),
            default_color,
            rotation: Rotation::default(),
            repeat: DEFAULT_REPEAT,
            lighting: None,
            shadow_intensity: None,
        }
    }

    pub fn with_view_mode(mut self, mode: ViewMode) -> Self {
        self.repeat = mode.preview_repeat();
        self
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pattern source was parsed for the first time.
    RegionsDetected {
        source_key: String,
        region_ids: Vec<RegionId>,
    },
    Notice(Notice),
    CompositeReady(Arc<CompositeResult>),
}

#[derive(Debug, Default)]
struct RebuildGate {
    generation: AtomicU64,
}

/// Permission for one rebuild to publish, valid until a newer one is issued.
#[derive(Debug, Clone)]
pub struct RebuildTicket {
    gate: Arc<RebuildGate>,
    generation: u64,
}

impl RebuildTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.gate.generation.load(Ordering::SeqCst) == self.generation
    }

    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(PipelineError::Cancelled)
        }
    }
}

fn build_cache_key(doc: &PatternDocument, params: &RebuildParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update([TEXTURE_CACHE_VERSION]);
    hasher.update(doc.source_key.as_bytes());
    hasher.update(doc.markup.as_bytes());
    for (id, color) in params.colors.iter() {
        hasher.update(id.as_bytes());
        hasher.update([0, color.red, color.green, color.blue]);
    }
    let default = params.default_color;
    hasher.update([default.red, default.green, default.blue]);
    hasher.update(params.rotation.degrees().to_le_bytes());
    hasher.update(params.repeat.to_le_bytes());
    hasher.update(TILE_RASTER_SIZE.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// The active backend and the rebuild whose texture it currently holds.
struct ProjectorSlot {
    backend: Box<dyn Projector>,
    calibrated: Option<LightingControls>,
    owner: Option<u64>,
}

impl ProjectorSlot {
    fn new(backend: Box<dyn Projector>, calibrated: Option<LightingControls>) -> Self {
        Self {
            backend,
            calibrated,
            owner: None,
        }
    }
}

pub struct PreviewPipeline {
    room: Arc<LoadedRoom>,
    projector: Arc<Mutex<ProjectorSlot>>,
    gate: Arc<RebuildGate>,
    patterns: &'static AssetCache<LoadedPattern>,
    textures: Mutex<HashMap<String, Arc<Texture>>>,
    announced: Mutex<HashSet<String>>,
    latest: Mutex<Option<Arc<CompositeResult>>>,
    events: Sender<PipelineEvent>,
}

impl PreviewPipeline {
    /// Builds a pipeline for `room` using the manifest's backend. Room load
    /// notices are queued as the first events.
    pub fn new(room: LoadedRoom) -> (Self, Receiver<PipelineEvent>) {
        let (events, receiver) = unbounded();
        for notice in &room.notices {
            let _ = events.try_send(PipelineEvent::Notice(notice.clone()));
        }
        let backend = room.manifest.backend.clone();
        let calibrated = backend.lighting();
        let projector = backend.into_projector();
        log::info!(
            "Preview pipeline for room {} using {} backend",
            room.manifest.name,
            projector.name()
        );
        let pipeline = Self {
            room: Arc::new(room),
            projector: Arc::new(Mutex::new(ProjectorSlot::new(projector, calibrated))),
            gate: Arc::new(RebuildGate::default()),
            patterns: pattern_cache(),
            textures: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            latest: Mutex::new(None),
            events,
        };
        (pipeline, receiver)
    }

    pub fn room(&self) -> &LoadedRoom {
        &self.room
    }

    /// Swaps the projection backend. The previous backend releases its
    /// resources when dropped.
    pub fn set_backend(&self, backend: BackendConfig) {
        let calibrated = backend.lighting();
        self.install(backend.into_projector(), calibrated);
    }

    /// Installs a custom backend. Without calibrated lighting it only sees
    /// the lighting a rebuild asks for explicitly.
    pub fn set_projector(&self, projector: Box<dyn Projector>) {
        self.install(projector, None);
    }

    fn install(&self, projector: Box<dyn Projector>, calibrated: Option<LightingControls>) {
        log::info!("Switching projection backend to {}", projector.name());
        *lock(&self.projector) = ProjectorSlot::new(projector, calibrated);
    }

    /// Issues a ticket that supersedes every earlier one.
    pub fn begin(&self) -> RebuildTicket {
        let generation = self.gate.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RebuildTicket {
            gate: Arc::clone(&self.gate),
            generation,
        }
    }

    pub async fn rebuild(
        &self,
        params: &RebuildParams,
    ) -> Result<Arc<CompositeResult>, PipelineError> {
        let ticket = self.begin();
        self.rebuild_with(&ticket, params).await
    }

    /// Runs a rebuild under `ticket`. Returns [`PipelineError::Cancelled`]
    /// once a newer ticket exists; a cancelled rebuild that already bound its
    /// texture to the backend releases it.
    pub async fn rebuild_with(
        &self,
        ticket: &RebuildTicket,
        params: &RebuildParams,
    ) -> Result<Arc<CompositeResult>, PipelineError> {
        let outcome = self.run_rebuild(ticket, params).await;
        if matches!(outcome, Err(PipelineError::Cancelled)) {
            self.release_if_owned(ticket.generation);
        }
        outcome
    }

    fn release_if_owned(&self, generation: u64) {
        let mut slot = lock(&self.projector);
        if slot.owner == Some(generation) {
            slot.backend.release_texture();
            slot.owner = None;
            log::debug!("Rebuild {} cancelled, texture released", generation);
        }
    }

    async fn run_rebuild(
        &self,
        ticket: &RebuildTicket,
        params: &RebuildParams,
    ) -> Result<Arc<CompositeResult>, PipelineError> {
        let timing = debug_timing_enabled();
        let total_start = Instant::now();
        let mut notices = Vec::new();
        let (cw, ch) = self.room.canvas_size();

        ticket.checkpoint()?;
        let stage_start = Instant::now();
        let document = self.resolve_pattern(params, &mut notices).await;
        if timing {
            log::info!(
                "[rebuild {}] pattern ready in {}ms",
                ticket.generation,
                stage_start.elapsed().as_millis()
            );
        }

        ticket.checkpoint()?;
        let stage_start = Instant::now();
        let texture = match document {
            Some(doc) => self.texture_for(doc, params).await?,
            None => Arc::new(Texture::placeholder(params.default_color)),
        };
        if timing {
            log::info!(
                "[rebuild {}] texture {}x{} in {}ms",
                ticket.generation,
                texture.width(),
                texture.height(),
                stage_start.elapsed().as_millis()
            );
        }

        ticket.checkpoint()?;
        let stage_start = Instant::now();
        let projector = Arc::clone(&self.projector);
        let lighting = params.lighting;
        let generation = ticket.generation;
        let job_texture = Arc::clone(&texture);
        let floor = smol::unblock(move || {
            let mut slot = lock(&*projector);
            if let Some(lighting) = lighting.or(slot.calibrated) {
                slot.backend.apply_lighting(&lighting);
            }
            let floor = slot.backend.project(&job_texture, cw, ch)?;
            slot.owner = Some(generation);
            Ok::<_, PipelineError>(floor)
        })
        .await
        .map_err(|err| {
            log::error!("Projection failed: {}", err);
            err
        })?;
        if timing {
            log::info!(
                "[rebuild {}] projection in {}ms",
                ticket.generation,
                stage_start.elapsed().as_millis()
            );
        }

        ticket.checkpoint()?;
        let stage_start = Instant::now();
        let room = Arc::clone(&self.room);
        let shadow_intensity = params
            .shadow_intensity
            .unwrap_or(room.manifest.shadow_intensity);
        let image = smol::unblock(move || {
            let foreground = room.asset.foreground_layer();
            let shadow = room.shadow.as_deref().map(|s| (s, shadow_intensity));
            composite(&floor, shadow, &foreground, cw, ch)
        })
        .await;
        if timing {
            log::info!(
                "[rebuild {}] composite in {}ms",
                ticket.generation,
                stage_start.elapsed().as_millis()
            );
        }

        let result = Arc::new(CompositeResult {
            image,
            notices: notices.clone(),
        });
        {
            let mut latest = lock(&self.latest);
            ticket.checkpoint()?;
            *latest = Some(Arc::clone(&result));
        }
        for notice in notices {
            self.emit(PipelineEvent::Notice(notice));
        }
        self.emit(PipelineEvent::CompositeReady(Arc::clone(&result)));
        log::info!(
            "Rebuild {} published {}x{} in {}ms",
            ticket.generation,
            cw,
            ch,
            total_start.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Loads the pattern, announcing its regions the first time it parses.
    /// Failures become notices and a `None` document.
    async fn resolve_pattern(
        &self,
        params: &RebuildParams,
        notices: &mut Vec<Notice>,
    ) -> Option<Arc<PatternDocument>> {
        let loaded = match load_pattern(self.patterns, &params.pattern_source).await {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!("Pattern unavailable, using placeholder: {}", err);
                notices.push(Notice::from_error(&err));
                return None;
            }
        };
        match loaded.as_ref() {
            LoadedPattern::Vector(doc) => {
                let first_time = lock(&self.announced).insert(doc.source_key.clone());
                if first_time {
                    self.emit(PipelineEvent::RegionsDetected {
                        source_key: doc.source_key.clone(),
                        region_ids: doc.region_ids.clone(),
                    });
                }
                Some(Arc::clone(doc))
            }
            LoadedPattern::Passthrough { reason, .. } => {
                notices.push(Notice::from_error(&PipelineError::Parse {
                    source_key: params.pattern_source.clone(),
                    reason: reason.clone(),
                }));
                None
            }
        }
    }

    async fn texture_for(
        &self,
        doc: Arc<PatternDocument>,
        params: &RebuildParams,
    ) -> Result<Arc<Texture>, PipelineError> {
        let key = build_cache_key(&doc, params);
        if let Some(texture) = lock(&self.textures).get(&key) {
            log::debug!("Texture memo hit {}", &key[..12]);
            return Ok(Arc::clone(texture));
        }

        let colors = params.colors.clone();
        let (default_color, rotation, repeat) =
            (params.default_color, params.rotation, params.repeat);
        let texture = smol::unblock(move || {
            build_texture(&doc, &colors, default_color, rotation, repeat)
        })
        .await
        .map(Arc::new)?;

        let mut memo = lock(&self.textures);
        if memo.len() >= TEXTURE_MEMO_LIMIT {
            memo.clear();
        }
        memo.insert(key, Arc::clone(&texture));
        Ok(texture)
    }

    fn emit(&self, event: PipelineEvent) {
        // a dropped receiver just means nobody is listening
        let _ = self.events.try_send(event);
    }

    pub fn latest(&self) -> Option<Arc<CompositeResult>> {
        lock(&self.latest).clone()
    }

    /// Region under a point given in tile pixels, for click-to-paint.
    pub fn region_at(
        &self,
        pattern_source: &str,
        tile_point: (f32, f32),
        rotation: Rotation,
    ) -> Option<RegionId> {
        let loaded = self.patterns.get(pattern_source)?;
        let doc = loaded.document()?;
        let point = tile_point_to_document(
            tile_point,
            rotation,
            TILE_RASTER_SIZE as f32,
            doc.width,
            doc.height,
        )?;
        doc.hit_test(point).map(str::to_string)
    }

    /// PNG bytes of the most recent published composite.
    pub async fn export_png(&self) -> Result<Vec<u8>, PipelineError> {
        let latest = self.latest().ok_or_else(|| {
            PipelineError::InvalidParameter("no composite has been rendered yet".to_string())
        })?;
        smol::unblock(move || encode_png(&latest.image)).await
    }

    /// Writes the latest composite into `dir` under the room's export name.
    pub async fn export_to_dir(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let bytes = self.export_png().await?;
        let path = dir.join(export_file_name(&self.room.manifest.name));
        let target = path.clone();
        smol::unblock(move || write_atomic(&target, &bytes)).await?;
        log::info!("Exported preview to {}", path.display());
        Ok(path)
    }
}
