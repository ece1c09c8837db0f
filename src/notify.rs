use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::Notice;

pub const SITE_PAGE_PREFIX: &str = "https://www.jinteki.net/";

// A connected page: the URL it announced and the writer feeding its socket.
#[derive(Debug, Clone)]
pub struct PageHandle {
    pub url: String,
    pub outbound: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Error)]
#[error("page {id} at {url} is no longer receiving")]
pub struct DeliveryError {
    id: u64,
    url: String,
}

pub fn is_target_page(url: &str) -> bool {
    url.starts_with(SITE_PAGE_PREFIX)
}

// Best effort: the eligible set is evaluated fresh per round, and a page that
// went away only costs a log line, never the rest of the round.
pub fn notify_pages(pages: &HashMap<u64, PageHandle>, is_replacing: bool) {
    let notice = Notice::StatusChanged { is_replacing };
    let payload = match serde_json::to_string(&notice) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(?err, "failed serializing status notice");
            return;
        }
    };

    let mut delivered = 0usize;
    for (id, page) in pages {
        if !is_target_page(&page.url) {
            continue;
        }
        match deliver(*id, page, &payload) {
            Ok(()) => delivered += 1,
            Err(err) => warn!(%err, "skipping unreachable page"),
        }
    }
    debug!(delivered, is_replacing, "status change fan-out done");
}

fn deliver(id: u64, page: &PageHandle, payload: &str) -> Result<(), DeliveryError> {
    page.outbound.send(payload.to_owned()).map_err(|_| DeliveryError {
        id,
        url: page.url.clone(),
    })
}
