use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ALT_CARD_LOCALIZED: &str = "https://play.sneakdoorbeta.net/img/cards/zh-simp/";
pub const ALT_CARD_BASE: &str = "https://play.sneakdoorbeta.net/img/cards/en/";
pub const SITE_CARD_BASE: &str = "https://www.jinteki.net/img/cards/en/";

// Two substitutions take a failed localized image through the whole chain.
const MAX_SUBSTITUTIONS: u8 = 2;

// What a page reports about itself: the replacement status it was told about,
// the images found when its DOM became ready, images added later, and load
// failures (with the element's source at failure time).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PageEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged { is_replacing: bool },
    ImagesDiscovered { ids: Vec<u64> },
    ImageAdded { id: u64 },
    LoadFailed { id: u64, src: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PageEffect {
    SetSource { id: u64, src: String },
}

// One tier down per failure: localized alternate -> base alternate -> the
// site's own en image (back to png), then nothing.
pub fn next_source(src: &str) -> Option<String> {
    if let Some(code) = src.strip_prefix(ALT_CARD_LOCALIZED) {
        return Some(format!("{ALT_CARD_BASE}{code}"));
    }
    if let Some(code) = src.strip_prefix(ALT_CARD_BASE) {
        return Some(match code.strip_suffix(".webp") {
            Some(stem) => format!("{SITE_CARD_BASE}{stem}.png"),
            None => format!("{SITE_CARD_BASE}{code}"),
        });
    }
    None
}

// Per-page fallback state. Reported images are tracked for the page's whole
// life; failures rewrite sources only while replacement is on, and each image
// gets at most MAX_SUBSTITUTIONS rewrites, so a broken chain can never loop.
#[derive(Debug, Default)]
pub struct FallbackHandler {
    enabled: bool,
    attempts: HashMap<u64, u8>,
}

impl FallbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: PageEvent) -> Vec<PageEffect> {
        match event {
            PageEvent::StatusChanged { is_replacing } => {
                self.enabled = is_replacing;
                Vec::new()
            }
            // Ids are recorded even while replacement is off, so the images
            // already on the page are armed the moment it turns on.
            PageEvent::ImagesDiscovered { ids } => {
                for id in ids {
                    self.attempts.entry(id).or_insert(0);
                }
                Vec::new()
            }
            PageEvent::ImageAdded { id } => {
                self.attempts.entry(id).or_insert(0);
                Vec::new()
            }
            PageEvent::LoadFailed { id, src } => self.on_load_failed(id, &src),
        }
    }

    fn on_load_failed(&mut self, id: u64, src: &str) -> Vec<PageEffect> {
        if !self.enabled {
            return Vec::new();
        }
        let Some(attempts) = self.attempts.get_mut(&id) else {
            return Vec::new();
        };
        if *attempts >= MAX_SUBSTITUTIONS {
            return Vec::new();
        }
        let Some(next) = next_source(src) else {
            return Vec::new();
        };
        *attempts += 1;
        debug!(image = id, from = %src, to = %next, "image source stepping down one tier");
        vec![PageEffect::SetSource { id, src: next }]
    }
}

#[cfg(test)]
mod tests {
    use super::{next_source, FallbackHandler, PageEffect, PageEvent};

    fn armed_handler(ids: Vec<u64>) -> FallbackHandler {
        let mut handler = FallbackHandler::new();
        handler.handle(PageEvent::StatusChanged { is_replacing: true });
        handler.handle(PageEvent::ImagesDiscovered { ids });
        handler
    }

    #[test]
    fn failed_localized_image_walks_the_whole_chain() {
        let mut handler = armed_handler(vec![9]);

        let first = handler.handle(PageEvent::LoadFailed {
            id: 9,
            src: "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp".to_owned(),
        });
        assert_eq!(
            first,
            vec![PageEffect::SetSource {
                id: 9,
                src: "https://play.sneakdoorbeta.net/img/cards/en/01001.webp".to_owned(),
            }]
        );

        let second = handler.handle(PageEvent::LoadFailed {
            id: 9,
            src: "https://play.sneakdoorbeta.net/img/cards/en/01001.webp".to_owned(),
        });
        assert_eq!(
            second,
            vec![PageEffect::SetSource {
                id: 9,
                src: "https://www.jinteki.net/img/cards/en/01001.png".to_owned(),
            }]
        );

        let third = handler.handle(PageEvent::LoadFailed {
            id: 9,
            src: "https://www.jinteki.net/img/cards/en/01001.png".to_owned(),
        });
        assert!(third.is_empty());
    }

    #[test]
    fn base_alternate_image_skips_straight_to_the_site() {
        let mut handler = armed_handler(vec![3]);

        let effects = handler.handle(PageEvent::LoadFailed {
            id: 3,
            src: "https://play.sneakdoorbeta.net/img/cards/en/10005.webp".to_owned(),
        });
        assert_eq!(
            effects,
            vec![PageEffect::SetSource {
                id: 3,
                src: "https://www.jinteki.net/img/cards/en/10005.png".to_owned(),
            }]
        );
    }

    #[test]
    fn at_most_two_substitutions_per_image() {
        let mut handler = armed_handler(vec![5]);
        let localized = "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp";

        assert_eq!(
            handler
                .handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() })
                .len(),
            1
        );
        assert_eq!(
            handler
                .handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() })
                .len(),
            1
        );
        // Third failure is dropped even though another tier would exist.
        assert!(handler
            .handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() })
            .is_empty());
    }

    #[test]
    fn failures_are_ignored_while_replacement_is_off() {
        let mut handler = FallbackHandler::new();
        handler.handle(PageEvent::ImagesDiscovered { ids: vec![1] });

        let effects = handler.handle(PageEvent::LoadFailed {
            id: 1,
            src: "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp".to_owned(),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn images_seen_while_off_are_armed_once_replacement_turns_on() {
        let mut handler = FallbackHandler::new();
        handler.handle(PageEvent::ImagesDiscovered { ids: vec![1] });
        handler.handle(PageEvent::StatusChanged { is_replacing: true });

        let effects = handler.handle(PageEvent::LoadFailed {
            id: 1,
            src: "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp".to_owned(),
        });
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn an_off_period_does_not_reset_the_substitution_bound() {
        let mut handler = armed_handler(vec![5]);
        let localized = "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp";
        handler.handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() });
        handler.handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() });

        handler.handle(PageEvent::StatusChanged { is_replacing: false });
        handler.handle(PageEvent::StatusChanged { is_replacing: true });

        assert!(handler
            .handle(PageEvent::LoadFailed { id: 5, src: localized.to_owned() })
            .is_empty());
    }

    #[test]
    fn dynamically_added_images_are_armed() {
        let mut handler = armed_handler(Vec::new());
        handler.handle(PageEvent::ImageAdded { id: 42 });

        let effects = handler.handle(PageEvent::LoadFailed {
            id: 42,
            src: "https://play.sneakdoorbeta.net/img/cards/zh-simp/20010.webp".to_owned(),
        });
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn unknown_images_are_ignored() {
        let mut handler = armed_handler(vec![1]);

        let effects = handler.handle(PageEvent::LoadFailed {
            id: 2,
            src: "https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp".to_owned(),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn next_source_only_steps_down_known_prefixes() {
        assert_eq!(
            next_source("https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp").as_deref(),
            Some("https://play.sneakdoorbeta.net/img/cards/en/01001.webp")
        );
        assert_eq!(
            next_source("https://play.sneakdoorbeta.net/img/cards/en/01001.webp").as_deref(),
            Some("https://www.jinteki.net/img/cards/en/01001.png")
        );
        assert_eq!(
            next_source("https://www.jinteki.net/img/cards/en/01001.png"),
            None
        );
        assert_eq!(next_source("https://example.org/a.webp"), None);
    }
}
