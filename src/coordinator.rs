use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    engine::RuleEngine,
    notify::{notify_pages, PageHandle},
    protocol::{Request, Response},
    rules::RuleSynchronizer,
    store::ToggleStore,
};

#[derive(Debug)]
pub enum CoordinatorMessage {
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    StorageChanged {
        old: bool,
        new: bool,
    },
    PageOpened {
        id: u64,
        page: PageHandle,
    },
    PageClosed {
        id: u64,
    },
}

// Sole owner of the in-memory toggle and of the connected-page set. Every
// mutation arrives through the inbox, so transitions never interleave.
pub struct Coordinator<E> {
    is_replacing: bool,
    store: ToggleStore,
    rules: RuleSynchronizer<E>,
    pages: HashMap<u64, PageHandle>,
    // Last value this process knows to be in the toggle document, shared with
    // the storage watcher so the watcher only reports foreign changes.
    persisted: Arc<AtomicBool>,
}

impl<E: RuleEngine> Coordinator<E> {
    pub fn new(
        store: ToggleStore,
        rules: RuleSynchronizer<E>,
        persisted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            is_replacing: false,
            store,
            rules,
            pages: HashMap::new(),
            persisted,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CoordinatorMessage>) {
        self.startup();
        while let Some(message) = inbox.recv().await {
            self.handle_message(message);
        }
        info!("coordinator inbox closed; stopping");
    }

    // Adopts the persisted toggle and repairs any rule drift left behind by
    // an abnormal shutdown. No page is notified at startup.
    fn startup(&mut self) {
        self.is_replacing = match self.store.load() {
            Ok(value) => value,
            Err(err) => {
                warn!(?err, "could not read the persisted toggle; starting with replacement off");
                false
            }
        };
        self.persisted.store(self.is_replacing, Ordering::Relaxed);
        if let Err(err) = self.rules.reconcile(self.is_replacing) {
            warn!(?err, "startup reconcile failed; rules repair on the next toggle");
        }
        info!(is_replacing = self.is_replacing, "coordinator started");
    }

    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Request { request, reply } => {
                let response = self.handle_request(request);
                if reply.send(response).is_err() {
                    debug!("requester went away before the acknowledgment");
                }
            }
            CoordinatorMessage::StorageChanged { old, new } => self.adopt_external(old, new),
            CoordinatorMessage::PageOpened { id, page } => {
                debug!(page = id, url = %page.url, "page connected");
                self.pages.insert(id, page);
            }
            CoordinatorMessage::PageClosed { id } => {
                if self.pages.remove(&id).is_some() {
                    debug!(page = id, "page disconnected");
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Toggle => self.toggle(),
            Request::GetStatus => Response::Status {
                is_replacing: self.is_replacing,
            },
        }
    }

    // Persist, adopt, reconcile, notify; the acknowledgment goes out last.
    // A persist failure aborts the whole transition.
    fn toggle(&mut self) -> Response {
        let next = !self.is_replacing;
        if let Err(err) = self.store.save(next) {
            warn!(?err, "toggle aborted: the new value could not be persisted");
            return Response::Toggled {
                success: false,
                is_replacing: self.is_replacing,
            };
        }
        self.is_replacing = next;
        self.persisted.store(next, Ordering::Relaxed);
        if let Err(err) = self.rules.reconcile(next) {
            warn!(?err, "reconcile failed; installed rules lag the persisted toggle");
        }
        notify_pages(&self.pages, next);
        info!(is_replacing = next, "toggle applied");
        Response::Toggled {
            success: true,
            is_replacing: next,
        }
    }

    // A storage change carrying the value already in memory is the echo of
    // our own save; adopting it again would only repeat the fan-out.
    fn adopt_external(&mut self, old: bool, new: bool) {
        // Whatever we do with it, the document holds `new` now.
        self.persisted.store(new, Ordering::Relaxed);
        if new == self.is_replacing {
            debug!(value = new, "storage change already reflected; ignoring");
            return;
        }
        info!(old, new, "adopting an externally changed toggle");
        self.is_replacing = new;
        if let Err(err) = self.rules.reconcile(new) {
            warn!(?err, "reconcile failed; installed rules lag the adopted toggle");
        }
        notify_pages(&self.pages, new);
    }
}

// Request/acknowledgment round trip used by the socket and HTTP handlers.
// None means the coordinator is gone.
pub async fn submit(
    tx: &mpsc::UnboundedSender<CoordinatorMessage>,
    request: Request,
) -> Option<Response> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let message = CoordinatorMessage::Request {
        request,
        reply: reply_tx,
    };
    if tx.send(message).is_err() {
        return None;
    }
    reply_rx.await.ok()
}
