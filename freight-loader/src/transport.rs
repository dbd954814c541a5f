use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::loader::LoaderEvent;
use crate::resource::{LoadKind, ResponseKind};
use freight_base::hashing::HashMap;
use freight_base::ResourceHandle;

/// Everything a transport needs to fetch one resource's payload.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub handle: ResourceHandle,
    pub url: String,
    pub load_kind: LoadKind,
    pub response_kind: ResponseKind,
    pub is_data_url: bool,
}

/// Sent back to the loader when a transport operation finishes. The error
/// side is a transport-level message; the loader wraps it into a
/// [`LoadError`](crate::LoadError) and may retry against a fallback url.
#[derive(Debug)]
pub struct TransportResult {
    pub handle: ResourceHandle,
    pub url: String,
    pub result: Result<Vec<u8>, String>,
}

/// A content source the loader can fetch from.
///
/// Implementations receive a `Sender<LoaderEvent>` at construction and
/// deliver every outcome as a [`LoaderEvent::TransportComplete`]; delivery
/// may happen from another thread, the channel serializes it into the
/// loader's update loop. This crate prescribes no wire protocol or decode
/// path, only this boundary.
pub trait Transport {
    /// Issues the fetch for one resource. Must eventually produce exactly
    /// one `TransportComplete` event for the request, unless cancelled.
    fn begin(
        &mut self,
        request: TransportRequest,
    );

    /// Best-effort cancellation of an in-flight operation. Transports that
    /// cannot cancel may ignore this; late results are dropped by the
    /// resource state machine.
    fn cancel(
        &mut self,
        handle: ResourceHandle,
    ) {
        let _ = handle;
    }
}

struct MemoryTransportInner {
    content: HashMap<String, Vec<u8>>,
    held: Vec<TransportRequest>,
    hold_all: bool,
}

/// In-memory content source, primarily for tests and demos.
///
/// Keyed by url. In held mode requests park until released by the caller,
/// which is how tests model workers that complete only when externally
/// signalled. Data urls are answered inline without consulting the content
/// map. Clones share state, so a test can keep one clone while the loader
/// owns another.
#[derive(Clone)]
pub struct MemoryTransport {
    events_tx: Sender<LoaderEvent>,
    inner: Arc<Mutex<MemoryTransportInner>>,
}

impl MemoryTransport {
    pub fn new(events_tx: Sender<LoaderEvent>) -> Self {
        Self {
            events_tx,
            inner: Arc::new(Mutex::new(MemoryTransportInner {
                content: HashMap::default(),
                held: Vec::new(),
                hold_all: false,
            })),
        }
    }

    pub fn insert(
        &self,
        url: &str,
        bytes: Vec<u8>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .content
            .insert(url.to_string(), bytes);
    }

    /// While holding, requests park instead of completing immediately.
    pub fn set_hold_all(
        &self,
        hold: bool,
    ) {
        self.inner.lock().unwrap().hold_all = hold;
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().held.len()
    }

    /// Releases the first parked request for `url`. Returns false if none
    /// was parked.
    pub fn release(
        &self,
        url: &str,
    ) -> bool {
        let request = {
            let mut inner = self.inner.lock().unwrap();
            match inner.held.iter().position(|r| r.url == url) {
                Some(index) => inner.held.remove(index),
                None => return false,
            }
        };
        self.fulfil(request);
        true
    }

    pub fn release_all(&self) {
        let held = std::mem::take(&mut self.inner.lock().unwrap().held);
        for request in held {
            self.fulfil(request);
        }
    }

    fn fulfil(
        &self,
        request: TransportRequest,
    ) {
        let result = if request.is_data_url {
            data_url_payload(&request.url)
        } else {
            self.inner
                .lock()
                .unwrap()
                .content
                .get(&request.url)
                .cloned()
                .ok_or_else(|| format!("no content for url '{}'", request.url))
        };
        let _ = self.events_tx.send(LoaderEvent::TransportComplete(TransportResult {
            handle: request.handle,
            url: request.url,
            result,
        }));
    }
}

impl Transport for MemoryTransport {
    fn begin(
        &mut self,
        request: TransportRequest,
    ) {
        log::trace!("memory transport request for '{}'", request.url);
        let hold = {
            let mut inner = self.inner.lock().unwrap();
            if inner.hold_all {
                inner.held.push(request.clone());
                true
            } else {
                false
            }
        };
        if !hold {
            self.fulfil(request);
        }
    }

    fn cancel(
        &mut self,
        handle: ResourceHandle,
    ) {
        // Parked requests for the handle are simply dropped
        self.inner.lock().unwrap().held.retain(|r| r.handle != handle);
    }
}

/// Payload of a `data:` url: everything after the first comma, uninterpreted.
/// Percent- and base64-encoded bodies are a host-platform concern.
fn data_url_payload(url: &str) -> Result<Vec<u8>, String> {
    match url.split_once(',') {
        Some((_, body)) => Ok(body.as_bytes().to_vec()),
        None => Err(format!("malformed data url '{}'", url)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(handle: u64, url: &str) -> TransportRequest {
        TransportRequest {
            handle: ResourceHandle(handle),
            url: url.to_string(),
            load_kind: LoadKind::Request,
            response_kind: ResponseKind::Binary,
            is_data_url: url.starts_with("data:"),
        }
    }

    #[test]
    fn immediate_mode_answers_from_content_map() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = MemoryTransport::new(tx);
        transport.insert("a.bin", vec![1, 2]);

        transport.begin(request(1, "a.bin"));
        match rx.try_recv().unwrap() {
            LoaderEvent::TransportComplete(result) => {
                assert_eq!(result.result.unwrap(), vec![1, 2]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn missing_content_is_a_transport_error() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = MemoryTransport::new(tx);
        transport.begin(request(1, "nowhere.bin"));
        match rx.try_recv().unwrap() {
            LoaderEvent::TransportComplete(result) => assert!(result.result.is_err()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn held_requests_complete_on_release() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = MemoryTransport::new(tx);
        transport.set_hold_all(true);
        transport.insert("a.bin", vec![9]);

        transport.begin(request(1, "a.bin"));
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.pending(), 1);

        assert!(transport.release("a.bin"));
        assert!(rx.try_recv().is_ok());
        assert!(!transport.release("a.bin"));
    }

    #[test]
    fn data_urls_answer_inline() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = MemoryTransport::new(tx);
        transport.begin(request(1, "data:text/plain,hello"));
        match rx.try_recv().unwrap() {
            LoaderEvent::TransportComplete(result) => {
                assert_eq!(result.result.unwrap(), b"hello".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn cancel_drops_parked_requests() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = MemoryTransport::new(tx);
        transport.set_hold_all(true);
        transport.insert("a.bin", vec![1]);
        transport.begin(request(1, "a.bin"));

        transport.cancel(ResourceHandle(1));
        assert_eq!(transport.pending(), 0);
        transport.release_all();
        assert!(rx.try_recv().is_err());
    }
}
