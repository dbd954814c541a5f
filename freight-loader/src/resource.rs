use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::LoadError;
use crate::loader::AddItem;
use freight_base::ResourceHandle;

/// Load progression for a single resource.
///
/// `NotStarted -> Loading -> Complete`. An aborted resource is `Complete`
/// with `error` set. `Complete` is terminal: the transport handle is
/// detached and no further transitions occur.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadState {
    NotStarted,
    Loading,
    Complete,
}

/// Content kind of a resource, derived from the url extension unless
/// overridden at `add` time or refined by middleware.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResourceType {
    Unknown,
    Json,
    Xml,
    Image,
    Audio,
    Video,
    Text,
    Binary,
}

impl ResourceType {
    pub fn from_extension(extension: &str) -> ResourceType {
        match extension {
            "json" => ResourceType::Json,
            "xml" | "svg" | "html" => ResourceType::Xml,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tga" | "tiff" => {
                ResourceType::Image
            }
            "mp3" | "ogg" | "wav" | "flac" | "m4a" => ResourceType::Audio,
            "mp4" | "webm" | "mov" | "mkv" => ResourceType::Video,
            "txt" | "text" | "csv" | "vert" | "frag" | "fnt" => ResourceType::Text,
            "bin" | "wasm" | "ttf" | "otf" | "woff" | "woff2" => ResourceType::Binary,
            _ => ResourceType::Unknown,
        }
    }
}

/// Coarse transport strategy. Which platform-level fetch path a transport
/// should take for this resource.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadKind {
    /// Generic request for bytes, the default
    Request,
    Image,
    Audio,
    Video,
}

impl LoadKind {
    pub fn from_extension(extension: &str) -> LoadKind {
        match extension {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" => LoadKind::Image,
            "mp3" | "ogg" | "wav" | "flac" | "m4a" => LoadKind::Audio,
            "mp4" | "webm" | "mov" | "mkv" => LoadKind::Video,
            _ => LoadKind::Request,
        }
    }
}

/// Expected interpretation of the transport response. Independent of
/// [`LoadKind`]: both tables consult the extension but answer different
/// questions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResponseKind {
    /// Raw bytes, the default
    Binary,
    Json,
    Text,
    Document,
}

impl ResponseKind {
    pub fn from_extension(extension: &str) -> ResponseKind {
        match extension {
            "json" => ResponseKind::Json,
            "xml" | "svg" | "html" => ResponseKind::Document,
            "txt" | "text" | "csv" | "vert" | "frag" | "fnt" => ResponseKind::Text,
            _ => ResponseKind::Binary,
        }
    }
}

/// Decoded payload of a completed resource. This is what the "raw" output
/// map of the loader exposes to collaborators such as atlas slicers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceData {
    None,
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
    Xml(String),
}

impl ResourceData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResourceData::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ResourceData::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResourceData::Text(text) => Some(text),
            ResourceData::Xml(text) => Some(text),
            _ => None,
        }
    }
}

/// Extracts the lowercased extension of a url, ignoring query and fragment.
pub fn url_extension(url: &str) -> String {
    let path = url
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(url)
        .split_once('#')
        .map(|(path, _)| path)
        .unwrap_or(url);
    match path.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// One named, independently loadable unit of content.
///
/// The loader owns every resource in its arena; middleware stages receive a
/// mutable borrow for the duration of their run. State transitions:
/// - `begin_load` moves `NotStarted -> Loading` exactly once per cycle
/// - `complete` moves to `Complete` and panics if called twice
/// - `abort` records the first error and finalizes; repeated aborts while an
///   error is set are silent no-ops, but aborting a successfully completed
///   resource is a caller bug and panics
pub struct Resource {
    name: String,
    urls: Vec<String>,
    // Index of the url currently being fetched; advances on transport
    // failure when fallbacks remain
    url_cursor: usize,
    state: LoadState,
    error: Option<LoadError>,
    kind: ResourceType,
    load_kind: LoadKind,
    response_kind: ResponseKind,
    is_data_url: bool,
    timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    progress_chunk: f32,
    pub(crate) children: Vec<ResourceHandle>,
    pub(crate) parent: Option<ResourceHandle>,
    metadata: Value,
    data: ResourceData,
    // Undecoded transport payload, kept through the post-load series so
    // stages can slice it, then released
    scratch: Option<Vec<u8>>,
    // Child resources a middleware stage discovered during this resource's
    // own load; the loader adopts and enqueues them after the stage advances
    pub(crate) discovered: Vec<AddItem>,
}

impl Resource {
    pub(crate) fn new(
        name: String,
        urls: Vec<String>,
        kind: Option<ResourceType>,
        load_kind: Option<LoadKind>,
        response_kind: Option<ResponseKind>,
        timeout: Option<Duration>,
        metadata: Value,
    ) -> Self {
        debug_assert!(!urls.is_empty());
        let extension = url_extension(&urls[0]);
        let is_data_url = urls[0].starts_with("data:");
        Self {
            name,
            kind: kind.unwrap_or_else(|| ResourceType::from_extension(&extension)),
            load_kind: load_kind.unwrap_or_else(|| LoadKind::from_extension(&extension)),
            response_kind: response_kind
                .unwrap_or_else(|| ResponseKind::from_extension(&extension)),
            urls,
            url_cursor: 0,
            state: LoadState::NotStarted,
            error: None,
            is_data_url,
            timeout,
            deadline: None,
            progress_chunk: 0.0,
            children: Vec::new(),
            parent: None,
            metadata,
            data: ResourceData::None,
            scratch: None,
            discovered: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The url currently selected for transport (fallbacks advance it).
    pub fn url(&self) -> &str {
        &self.urls[self.url_cursor]
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    pub fn is_complete(&self) -> bool {
        self.state == LoadState::Complete
    }

    pub fn is_data_url(&self) -> bool {
        self.is_data_url
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    pub fn set_kind(
        &mut self,
        kind: ResourceType,
    ) {
        self.kind = kind;
    }

    pub fn load_kind(&self) -> LoadKind {
        self.load_kind
    }

    pub fn response_kind(&self) -> ResponseKind {
        self.response_kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn progress_chunk(&self) -> f32 {
        self.progress_chunk
    }

    pub(crate) fn set_progress_chunk(
        &mut self,
        chunk: f32,
    ) {
        self.progress_chunk = chunk;
    }

    pub fn children(&self) -> &[ResourceHandle] {
        &self.children
    }

    pub fn parent(&self) -> Option<ResourceHandle> {
        self.parent
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Value {
        &mut self.metadata
    }

    pub fn data(&self) -> &ResourceData {
        &self.data
    }

    /// Sets the decoded payload. Intended for pre-load stages serving from a
    /// cache before marking the resource complete.
    pub fn set_data(
        &mut self,
        data: ResourceData,
    ) {
        self.data = data;
    }

    /// The undecoded transport payload, available to post-load stages until
    /// released.
    pub fn scratch(&self) -> Option<&[u8]> {
        self.scratch.as_deref()
    }

    pub fn release_scratch(&mut self) {
        self.scratch = None;
    }

    /// Queues a child resource discovered during this resource's own load
    /// (e.g. an atlas image referenced by a sprite-sheet json). The loader
    /// adopts it, re-weights progress chunks and schedules it with priority.
    pub fn discover(
        &mut self,
        item: AddItem,
    ) {
        self.discovered.push(item);
    }

    /// `NotStarted -> Loading`. Returns false if the resource is already
    /// loading or finalized, in which case the caller must not re-enter the
    /// transport path.
    pub(crate) fn begin_load(&mut self) -> bool {
        if self.state != LoadState::NotStarted {
            return false;
        }
        self.state = LoadState::Loading;
        true
    }

    /// Finalizes the resource successfully. The complete transition happens
    /// exactly once; a second invocation is a caller bug.
    pub fn complete(&mut self) {
        if self.state == LoadState::Complete {
            panic!("complete() invoked twice on resource '{}'", self.name);
        }
        log::debug!("resource '{}' complete", self.name);
        self.state = LoadState::Complete;
        self.deadline = None;
    }

    /// Records the first error and finalizes. Repeated aborts while an error
    /// is set are no-ops; aborting after a successful completion panics.
    pub fn abort(
        &mut self,
        error: LoadError,
    ) {
        if self.error.is_some() {
            log::trace!("resource '{}' already aborted, ignoring: {}", self.name, error);
            return;
        }
        if self.state == LoadState::Complete {
            panic!(
                "abort() invoked on successfully completed resource '{}'",
                self.name
            );
        }
        log::debug!("resource '{}' aborted: {}", self.name, error);
        self.error = Some(error);
        self.state = LoadState::Complete;
        self.deadline = None;
    }

    pub(crate) fn arm_timeout(
        &mut self,
        now: Instant,
    ) {
        self.deadline = self.timeout.map(|timeout| now + timeout);
    }

    /// Advances to the next fallback url after a transport failure. Returns
    /// the url to retry with, or None when all sources are exhausted.
    pub(crate) fn advance_fallback(&mut self) -> Option<String> {
        if self.url_cursor + 1 < self.urls.len() {
            self.url_cursor += 1;
            Some(self.urls[self.url_cursor].clone())
        } else {
            None
        }
    }

    /// Accepts the transport payload, decodes it per the response kind and
    /// finalizes. Results arriving after finalization (e.g. after a timeout
    /// abort) are dropped: the transport handle is considered detached.
    pub(crate) fn finish_transport(
        &mut self,
        bytes: Vec<u8>,
    ) {
        if self.is_complete() {
            log::trace!(
                "transport result for finalized resource '{}', dropping",
                self.name
            );
            return;
        }
        match self.decode(&bytes) {
            Ok(data) => {
                self.data = data;
                if !matches!(self.data, ResourceData::Bytes(_)) {
                    self.scratch = Some(bytes);
                }
                self.complete();
            }
            Err(error) => {
                self.scratch = Some(bytes);
                self.abort(error);
            }
        }
    }

    fn decode(
        &self,
        bytes: &[u8],
    ) -> Result<ResourceData, LoadError> {
        match self.response_kind {
            ResponseKind::Binary => Ok(ResourceData::Bytes(bytes.to_vec())),
            ResponseKind::Json => serde_json::from_slice(bytes)
                .map(ResourceData::Json)
                .map_err(|e| LoadError::MalformedJson(std::sync::Arc::new(e))),
            ResponseKind::Text => String::from_utf8(bytes.to_vec())
                .map(ResourceData::Text)
                .map_err(|e| LoadError::MalformedText(std::sync::Arc::new(e))),
            ResponseKind::Document => String::from_utf8(bytes.to_vec())
                .map(ResourceData::Xml)
                .map_err(|e| LoadError::MalformedText(std::sync::Arc::new(e))),
        }
    }
}
