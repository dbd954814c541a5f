use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;

use crate::error::{LoadError, LoaderError};
use crate::middleware::{default_after_stages, LoadStage, Phase, StageToken};
use crate::resolve::{Constructed, ReferenceResolver};
use crate::resource::{LoadKind, Resource, ResourceData, ResourceType, ResponseKind};
use crate::transport::{Transport, TransportRequest, TransportResult};
use freight_base::hashing::{HashMap, HashSet};
use freight_base::task_queue::{TaskQueue, TaskToken};
use freight_base::ResourceHandle;

/// Loader events which drive state changes for resources. Produced by the
/// queue worker, by middleware continuations and by transports; consumed by
/// [`Loader::update`].
#[derive(Debug)]
pub enum LoaderEvent {
    // The queue dispatched a resource; the token holds its worker slot
    BeginLoad(ResourceHandle, TaskToken),
    // A middleware stage advanced its continuation
    StageComplete {
        handle: ResourceHandle,
        phase: Phase,
        next_index: usize,
    },
    // A middleware stage dropped its continuation without advancing
    StageDropped {
        handle: ResourceHandle,
        phase: Phase,
    },
    // Sent by a transport when a fetch succeeds or fails
    TransportComplete(TransportResult),
    // Deferred per-resource completion notice for already-complete resources,
    // so re-loads observe their callback asynchronously without re-entering
    // the transport path
    NotifyLoaded(ResourceHandle),
}

/// Progress notifications published on the loader's notification channel.
#[derive(Debug, Clone)]
pub enum LoaderNotification {
    Started,
    Progress {
        handle: ResourceHandle,
        name: String,
        progress: f32,
    },
    Error {
        handle: ResourceHandle,
        name: String,
        error: LoadError,
    },
    Loaded {
        handle: ResourceHandle,
        name: String,
    },
    Completed {
        progress: f32,
    },
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Soft cap on simultaneously in-flight transport operations
    pub concurrency: usize,
    /// Applied to resources added without their own timeout; None disables
    pub default_timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            default_timeout: None,
        }
    }
}

/// Per-resource options for [`Loader::add_with`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub kind: Option<ResourceType>,
    pub load_kind: Option<LoadKind>,
    pub response_kind: Option<ResponseKind>,
    pub timeout: Option<Duration>,
    /// Opaque pass-through for middleware stages
    pub metadata: Option<Value>,
    /// Required when adding while a load cycle is running
    pub parent: Option<ResourceHandle>,
}

/// One pending registration, used for element-wise bulk adds and for child
/// resources discovered by middleware mid-flight.
#[derive(Debug, Clone)]
pub struct AddItem {
    pub name: String,
    pub urls: Vec<String>,
    pub options: AddOptions,
}

impl AddItem {
    pub fn new(
        name: &str,
        url: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            urls: vec![url.to_string()],
            options: AddOptions::default(),
        }
    }

    /// Registration named after its url, for callers that have no better
    /// name for the resource.
    pub fn from_url(url: &str) -> Self {
        Self::new(url, url)
    }

    pub fn with_urls(
        name: &str,
        urls: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            options: AddOptions::default(),
        }
    }

    pub fn options(
        mut self,
        options: AddOptions,
    ) -> Self {
        self.options = options;
        self
    }
}

/// Orchestrator owning the resource registry, the task queue and the
/// middleware chains for one load cycle.
///
/// Single-threaded cooperative: the host calls [`Loader::update`] from its
/// own loop; all registry mutation happens while draining the event channel
/// there, so no locking guards the registry. Transports may deliver their
/// results from other threads, the channel serializes them.
pub struct Loader {
    resources: HashMap<ResourceHandle, Resource>,
    name_to_handle: HashMap<String, ResourceHandle>,
    insertion_order: Vec<ResourceHandle>,
    next_handle_index: u64,

    queue: TaskQueue<ResourceHandle>,
    // Worker slots held on behalf of resources between dispatch and the end
    // of their transport step
    tokens: HashMap<ResourceHandle, TaskToken>,
    // Resources past the queue but still running their post-load series.
    // Aggregate completion requires this to be empty in addition to queue
    // idleness, or a resource could be declared done mid-middleware.
    parsing: HashSet<ResourceHandle>,

    before_stages: Vec<Box<dyn LoadStage>>,
    after_stages: Vec<Box<dyn LoadStage>>,

    transport: Box<dyn Transport>,
    events_tx: Sender<LoaderEvent>,
    events_rx: Receiver<LoaderEvent>,
    notify_tx: Sender<LoaderNotification>,
    notify_rx: Receiver<LoaderNotification>,

    progress: f32,
    loading: bool,
    default_timeout: Option<Duration>,

    // Typed output map, filled by the reference-resolution pass
    constructed: HashMap<String, Rc<Constructed>>,
}

impl Loader {
    pub fn new<T, F>(
        config: LoaderConfig,
        make_transport: F,
    ) -> Self
    where
        T: Transport + 'static,
        F: FnOnce(Sender<LoaderEvent>) -> T,
    {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let transport = Box::new(make_transport(events_tx.clone()));
        Self {
            resources: HashMap::default(),
            name_to_handle: HashMap::default(),
            insertion_order: Vec::new(),
            next_handle_index: 1,
            queue: TaskQueue::new(config.concurrency),
            tokens: HashMap::default(),
            parsing: HashSet::default(),
            before_stages: Vec::new(),
            after_stages: default_after_stages(),
            transport,
            events_tx,
            events_rx,
            notify_tx,
            notify_rx,
            progress: 0.0,
            loading: false,
            default_timeout: config.default_timeout,
            constructed: HashMap::default(),
        }
    }

    /// Receiver for progress/error/completion notifications. Clone it and
    /// poll from wherever the host consumes loader state.
    pub fn notifications(&self) -> Receiver<LoaderNotification> {
        self.notify_rx.clone()
    }

    /// Registers a pre-load stage, after the built-in defaults and any
    /// previously registered stage.
    pub fn pre<S: LoadStage + 'static>(
        &mut self,
        stage: S,
    ) -> &mut Self {
        self.before_stages.push(Box::new(stage));
        self
    }

    /// Registers a post-load stage, after the built-in defaults and any
    /// previously registered stage.
    pub fn post<S: LoadStage + 'static>(
        &mut self,
        stage: S,
    ) -> &mut Self {
        self.after_stages.push(Box::new(stage));
        self
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn handle_of(
        &self,
        name: &str,
    ) -> Option<ResourceHandle> {
        self.name_to_handle.get(name).copied()
    }

    pub fn resource(
        &self,
        handle: ResourceHandle,
    ) -> Option<&Resource> {
        self.resources.get(&handle)
    }

    pub fn resource_by_name(
        &self,
        name: &str,
    ) -> Option<&Resource> {
        self.resources.get(self.name_to_handle.get(name)?)
    }

    /// All registered resources in insertion order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.insertion_order
            .iter()
            .filter_map(|handle| self.resources.get(handle))
    }

    /// The "raw" output map: original decoded payloads by resource name, for
    /// collaborators that need pre-construction access.
    pub fn raw_assets(&self) -> impl Iterator<Item = (&str, &ResourceData)> {
        self.resources().map(|r| (r.name(), r.data()))
    }

    /// The "typed" output map: engine objects built by the reference
    /// resolver's constructor table.
    pub fn typed_assets(&self) -> &HashMap<String, Rc<Constructed>> {
        &self.constructed
    }

    /// Registers a resource under a unique name. Programmer errors (duplicate
    /// name, missing url, adding while running without a parent) surface
    /// synchronously and leave the registry unchanged.
    pub fn add(
        &mut self,
        name: &str,
        url: &str,
    ) -> Result<ResourceHandle, LoaderError> {
        self.add_with(name, &[url], AddOptions::default())
    }

    /// Registers a resource named after its url. Duplicate detection applies
    /// to the url-as-name like any other name.
    pub fn add_url(
        &mut self,
        url: &str,
    ) -> Result<ResourceHandle, LoaderError> {
        self.add(url, url)
    }

    pub fn add_with(
        &mut self,
        name: &str,
        urls: &[&str],
        options: AddOptions,
    ) -> Result<ResourceHandle, LoaderError> {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        self.add_item(AddItem {
            name: name.to_string(),
            urls,
            options,
        })
    }

    /// Element-wise bulk registration. Items registered before a failing one
    /// remain registered.
    pub fn add_many(
        &mut self,
        items: Vec<AddItem>,
    ) -> Result<Vec<ResourceHandle>, LoaderError> {
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            handles.push(self.add_item(item)?);
        }
        Ok(handles)
    }

    fn add_item(
        &mut self,
        item: AddItem,
    ) -> Result<ResourceHandle, LoaderError> {
        let AddItem { name, urls, options } = item;
        if urls.is_empty() {
            return Err(LoaderError::MissingUrl(name));
        }
        if self.name_to_handle.contains_key(&name) {
            return Err(LoaderError::DuplicateResourceName(name));
        }
        let parent = options.parent;
        if self.loading {
            // Mid-flight additions must hang off known work, or the progress
            // scale would be re-divided under the caller's feet
            let Some(parent) = parent else {
                return Err(LoaderError::AddWhileLoadingRequiresParent(name));
            };
            if !self.resources.contains_key(&parent) {
                return Err(LoaderError::UnknownParentResource(name));
            }
        }

        let handle = ResourceHandle::new(self.next_handle_index);
        self.next_handle_index += 1;

        let mut resource = Resource::new(
            name.clone(),
            urls,
            options.kind,
            options.load_kind,
            options.response_kind,
            options.timeout.or(self.default_timeout),
            options.metadata.unwrap_or(Value::Null),
        );
        resource.parent = parent;
        self.resources.insert(handle, resource);
        self.name_to_handle.insert(name, handle);
        self.insertion_order.push(handle);

        if let Some(parent) = parent {
            if let Some(parent_resource) = self.resources.get_mut(&parent) {
                parent_resource.children.push(handle);
            }
        }

        if self.loading {
            let parent = parent.expect("checked above");
            self.rebalance_for_new_child(parent, handle);
            // Children unblock their parent's subtree, schedule them ahead
            // of unrelated pending work
            self.queue.unshift(handle);
        }

        Ok(handle)
    }

    /// Redistributes the parent's reserved share of the progress scale over
    /// the parent, its still-incomplete children and the new child, so the
    /// subtree's total weight never exceeds what the parent started with.
    fn rebalance_for_new_child(
        &mut self,
        parent: ResourceHandle,
        new_child: ResourceHandle,
    ) {
        let Some(parent_resource) = self.resources.get(&parent) else {
            return;
        };
        let incomplete: Vec<ResourceHandle> = parent_resource
            .children
            .iter()
            .copied()
            .filter(|&child| {
                child != new_child
                    && self
                        .resources
                        .get(&child)
                        .map(|r| !r.is_complete())
                        .unwrap_or(false)
            })
            .collect();

        // The parent's original share, undivided, re-divided among the
        // parent, its incomplete children and the new child. The new child
        // is deliberately absent from `incomplete`: it is the +2 term.
        let full_chunk = parent_resource.progress_chunk() * (incomplete.len() as f32 + 1.0);
        let each_chunk = full_chunk / (incomplete.len() as f32 + 2.0);

        if let Some(parent_resource) = self.resources.get_mut(&parent) {
            parent_resource.set_progress_chunk(each_chunk);
        }
        for child in incomplete.iter().chain(std::iter::once(&new_child)) {
            if let Some(child_resource) = self.resources.get_mut(child) {
                child_resource.set_progress_chunk(each_chunk);
            }
        }
    }

    /// Begins a load cycle over everything registered so far. No-op while a
    /// cycle is already running. Completion is observed via
    /// [`LoaderNotification::Completed`] or [`Loader::is_loading`].
    pub fn load(&mut self) -> &mut Self {
        if self.loading {
            return self;
        }
        self.loading = true;
        self.progress = 0.0;

        let pending: Vec<ResourceHandle> = self
            .insertion_order
            .iter()
            .copied()
            .filter(|handle| {
                self.resources
                    .get(handle)
                    .map(|r| !r.is_complete())
                    .unwrap_or(false)
            })
            .collect();

        if pending.is_empty() {
            self.progress = 100.0;
        } else {
            // Budget divided evenly across the initial work set; mid-flight
            // children re-divide their parent's share, never the total
            let chunk = 100.0 / pending.len() as f32;
            for handle in &pending {
                if let Some(resource) = self.resources.get_mut(handle) {
                    resource.set_progress_chunk(chunk);
                }
            }
        }

        log::debug!("load cycle started with {} pending resources", pending.len());
        self.notify(LoaderNotification::Started);

        for handle in self.insertion_order.clone() {
            let complete = self
                .resources
                .get(&handle)
                .map(|r| r.is_complete())
                .unwrap_or(true);
            if complete {
                // Idempotent re-load: observe completion asynchronously
                // without re-entering transport
                let _ = self.events_tx.send(LoaderEvent::NotifyLoaded(handle));
            } else {
                self.queue.push(handle);
            }
        }
        self.queue.resume();
        self
    }

    /// Aborts all in-flight resources and clears the registry.
    pub fn reset(&mut self) {
        log::debug!("loader reset");
        for handle in self.tokens.keys().copied().collect::<Vec<_>>() {
            self.transport.cancel(handle);
        }
        for handle in &self.insertion_order {
            if let Some(resource) = self.resources.get_mut(handle) {
                if !resource.is_complete() {
                    resource.abort(LoadError::Cancelled);
                }
            }
        }
        self.queue.kill();
        self.queue.pause();
        self.tokens.clear();
        self.parsing.clear();
        self.resources.clear();
        self.name_to_handle.clear();
        self.insertion_order.clear();
        self.constructed.clear();
        while self.events_rx.try_recv().is_ok() {}
        self.progress = 0.0;
        self.loading = false;
    }

    /// Cooperative pump: drains loader events and queue signals until both
    /// are quiescent, then checks for aggregate completion. The host calls
    /// this once per frame/tick.
    #[profiling::function]
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub(crate) fn update_at(
        &mut self,
        now: Instant,
    ) {
        loop {
            let mut worked = self.process_timeouts(now);

            let events_tx = self.events_tx.clone();
            worked |= self.queue.pump(|handle, token| {
                let _ = events_tx.send(LoaderEvent::BeginLoad(handle, token));
            });

            while let Ok(event) = self.events_rx.try_recv() {
                worked = true;
                self.handle_event(event, now);
            }

            if !worked {
                break;
            }
        }
        self.maybe_complete();
    }

    fn handle_event(
        &mut self,
        event: LoaderEvent,
        now: Instant,
    ) {
        log::trace!("handle event {:?}", event);
        match event {
            LoaderEvent::BeginLoad(handle, token) => self.handle_begin_load(handle, token, now),
            LoaderEvent::StageComplete {
                handle,
                phase,
                next_index,
            } => self.run_stage(handle, phase, next_index, now),
            LoaderEvent::StageDropped { handle, phase } => {
                self.handle_stage_dropped(handle, phase, now)
            }
            LoaderEvent::TransportComplete(result) => self.handle_transport_complete(result, now),
            LoaderEvent::NotifyLoaded(handle) => {
                if let Some(resource) = self.resources.get(&handle) {
                    self.notify(LoaderNotification::Loaded {
                        handle,
                        name: resource.name().to_string(),
                    });
                }
            }
        }
    }

    fn handle_begin_load(
        &mut self,
        handle: ResourceHandle,
        token: TaskToken,
        now: Instant,
    ) {
        let Some(resource) = self.resources.get_mut(&handle) else {
            // Registry was reset while this dispatch was in flight; dropping
            // the token frees the slot
            return;
        };
        if resource.is_complete() {
            token.complete();
            let _ = self.events_tx.send(LoaderEvent::NotifyLoaded(handle));
            return;
        }
        if !resource.begin_load() {
            log::warn!("resource '{}' dispatched while already loading", resource.name());
            token.complete();
            return;
        }
        self.tokens.insert(handle, token);
        self.run_stage(handle, Phase::Before, 0, now);
    }

    /// Runs one middleware stage, or transitions the phase when the series
    /// for it is exhausted. Pre-load short-circuits to the post-load series
    /// as soon as a stage marks the resource complete.
    fn run_stage(
        &mut self,
        handle: ResourceHandle,
        phase: Phase,
        index: usize,
        now: Instant,
    ) {
        if !self.resources.contains_key(&handle) {
            return;
        }
        if phase == Phase::Before {
            let complete = self
                .resources
                .get(&handle)
                .map(|r| r.is_complete())
                .unwrap_or(false);
            if complete {
                // A pre stage served this resource (e.g. from a cache):
                // remaining pre stages and the transport are skipped
                self.enter_after_phase(handle, now);
                return;
            }
        }

        let stage_count = match phase {
            Phase::Before => self.before_stages.len(),
            Phase::After => self.after_stages.len(),
        };
        if index >= stage_count {
            match phase {
                Phase::Before => self.start_transport(handle, now),
                Phase::After => self.finish_resource(handle),
            }
            return;
        }

        let token = StageToken::new(self.events_tx.clone(), handle, phase, index + 1);
        match phase {
            Phase::Before => {
                let stage = &mut self.before_stages[index];
                let resource = self.resources.get_mut(&handle).expect("checked above");
                stage.run(resource, token);
            }
            Phase::After => {
                let stage = &mut self.after_stages[index];
                let resource = self.resources.get_mut(&handle).expect("checked above");
                stage.run(resource, token);
            }
        }
        self.adopt_discovered(handle);
    }

    /// Adopts child resources a stage discovered during its run, re-weighting
    /// the parent's progress share for each.
    fn adopt_discovered(
        &mut self,
        parent: ResourceHandle,
    ) {
        let discovered = match self.resources.get_mut(&parent) {
            Some(resource) => std::mem::take(&mut resource.discovered),
            None => return,
        };
        for mut item in discovered {
            item.options.parent = Some(parent);
            if let Err(error) = self.add_item(item) {
                // A stage handed us an invalid registration; this is a bug in
                // the stage, not a runtime failure of the resource
                log::error!("discovered child rejected: {}", error);
            }
        }
    }

    fn handle_stage_dropped(
        &mut self,
        handle: ResourceHandle,
        phase: Phase,
        now: Instant,
    ) {
        let Some(resource) = self.resources.get_mut(&handle) else {
            return;
        };
        log::error!(
            "{} stage for resource '{}' dropped its continuation",
            phase.name(),
            resource.name()
        );
        if !resource.is_complete() {
            resource.abort(LoadError::StalledPipeline(phase.name()));
        }
        match phase {
            Phase::Before => self.enter_after_phase(handle, now),
            Phase::After => self.finish_resource(handle),
        }
    }

    fn start_transport(
        &mut self,
        handle: ResourceHandle,
        now: Instant,
    ) {
        let Some(resource) = self.resources.get_mut(&handle) else {
            return;
        };
        resource.arm_timeout(now);
        let request = TransportRequest {
            handle,
            url: resource.url().to_string(),
            load_kind: resource.load_kind(),
            response_kind: resource.response_kind(),
            is_data_url: resource.is_data_url(),
        };
        log::debug!("transport start for '{}' -> '{}'", resource.name(), request.url);
        self.transport.begin(request);
    }

    fn handle_transport_complete(
        &mut self,
        result: TransportResult,
        now: Instant,
    ) {
        let handle = result.handle;
        let Some(resource) = self.resources.get_mut(&handle) else {
            return;
        };
        if resource.is_complete() {
            // Timed out (or was cancelled) before the transport answered
            log::trace!("late transport result for '{}', dropping", resource.name());
            return;
        }
        match result.result {
            Ok(bytes) => {
                resource.finish_transport(bytes);
                self.enter_after_phase(handle, now);
            }
            Err(message) => {
                if let Some(next_url) = resource.advance_fallback() {
                    log::warn!(
                        "transport failed for '{}' ({}), retrying '{}'",
                        resource.name(),
                        message,
                        next_url
                    );
                    self.start_transport(handle, now);
                } else {
                    resource.abort(LoadError::Transport(message));
                    self.enter_after_phase(handle, now);
                }
            }
        }
    }

    /// Frees the worker slot and begins the post-load series. The resource
    /// stays in the parsing set until the series finishes, which holds off
    /// the aggregate completion check.
    fn enter_after_phase(
        &mut self,
        handle: ResourceHandle,
        now: Instant,
    ) {
        if let Some(token) = self.tokens.remove(&handle) {
            token.complete();
        }
        self.parsing.insert(handle);
        self.run_stage(handle, Phase::After, 0, now);
    }

    fn finish_resource(
        &mut self,
        handle: ResourceHandle,
    ) {
        self.parsing.remove(&handle);
        let Some(resource) = self.resources.get_mut(&handle) else {
            return;
        };
        resource.release_scratch();

        let name = resource.name().to_string();
        let chunk = resource.progress_chunk();
        let error = resource.error().cloned();

        self.progress = (self.progress + chunk).min(100.0);
        self.notify(LoaderNotification::Progress {
            handle,
            name: name.clone(),
            progress: self.progress,
        });
        match error {
            Some(error) => self.notify(LoaderNotification::Error {
                handle,
                name,
                error,
            }),
            None => self.notify(LoaderNotification::Loaded { handle, name }),
        }
    }

    fn process_timeouts(
        &mut self,
        now: Instant,
    ) -> bool {
        let expired: Vec<ResourceHandle> = self
            .resources
            .iter()
            .filter(|(_, resource)| {
                !resource.is_complete()
                    && resource.deadline.map(|deadline| deadline <= now).unwrap_or(false)
            })
            .map(|(handle, _)| *handle)
            .collect();

        for handle in &expired {
            log::warn!("resource {:?} timed out", handle);
            self.transport.cancel(*handle);
            if let Some(resource) = self.resources.get_mut(handle) {
                resource.abort(LoadError::Timeout);
            }
            self.enter_after_phase(*handle, now);
        }
        !expired.is_empty()
    }

    /// Declares the load cycle complete when the queue is idle and no
    /// resource remains mid-middleware. Fires exactly once per cycle.
    fn maybe_complete(&mut self) {
        if !self.loading || !self.queue.idle() || !self.parsing.is_empty() {
            return;
        }
        self.loading = false;
        self.queue.pause();
        log::debug!("load cycle complete at progress {}", self.progress);
        self.notify(LoaderNotification::Completed {
            progress: self.progress,
        });
    }

    /// Post-completion pass: builds the typed output map by constructing
    /// every composite payload and resolving its tagged references.
    pub fn resolve_references(
        &mut self,
        resolver: &ReferenceResolver,
    ) {
        // Register raw payloads first so deferred scene factories can find
        // each other regardless of construction order
        for resource in self.resources() {
            if let ResourceData::Json(value) = resource.data() {
                if value.is_object() && value.get("type").is_some() {
                    resolver.register_scene(resource.name(), value.clone());
                }
            }
        }
        let composites: Vec<(String, Value)> = self
            .resources()
            .filter_map(|resource| match resource.data() {
                ResourceData::Json(value)
                    if value.is_object() && value.get("type").is_some() =>
                {
                    Some((resource.name().to_string(), value.clone()))
                }
                _ => None,
            })
            .collect();
        for (name, value) in composites {
            let constructed = resolver.construct(&value);
            self.constructed.insert(name, constructed);
        }
    }

    fn notify(
        &self,
        notification: LoaderNotification,
    ) {
        let _ = self.notify_tx.send(notification);
    }
}
