use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::fallback::PageEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Toggle,
    GetStatus,
}

// Acknowledgments carry no action tag; the requester correlates them with
// what it asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    Toggled { success: bool, is_replacing: bool },
    #[serde(rename_all = "camelCase")]
    Status { is_replacing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Notice {
    #[serde(rename_all = "camelCase")]
    StatusChanged { is_replacing: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageMessage {
    Request(Request),
    Event(PageEvent),
}

pub fn parse_page_message(text: &str) -> Result<PageMessage> {
    if let Ok(request) = serde_json::from_str::<Request>(text) {
        return Ok(PageMessage::Request(request));
    }

    if let Ok(event) = serde_json::from_str::<PageEvent>(text) {
        return Ok(PageMessage::Event(event));
    }

    Err(anyhow!("payload did not match a request or page event"))
}

#[cfg(test)]
mod tests {
    use super::{parse_page_message, Notice, PageMessage, Request, Response};
    use crate::fallback::PageEvent;
    use serde_json::json;

    #[test]
    fn parses_toggle_request() {
        let parsed = parse_page_message(r#"{"action":"toggle"}"#).expect("expected request parse");
        assert_eq!(parsed, PageMessage::Request(Request::Toggle));
    }

    #[test]
    fn parses_status_request() {
        let parsed =
            parse_page_message(r#"{"action":"getStatus"}"#).expect("expected request parse");
        assert_eq!(parsed, PageMessage::Request(Request::GetStatus));
    }

    #[test]
    fn parses_load_failed_page_event() {
        let payload = r#"{
            "event":"loadFailed",
            "id":4,
            "src":"https://play.sneakdoorbeta.net/img/cards/zh-simp/01001.webp"
        }"#;

        let parsed = parse_page_message(payload).expect("expected page event parse");
        match parsed {
            PageMessage::Event(PageEvent::LoadFailed { id, src }) => {
                assert_eq!(id, 4);
                assert!(src.ends_with("01001.webp"));
            }
            _ => panic!("expected a load failure event"),
        }
    }

    #[test]
    fn parses_images_discovered_page_event() {
        let parsed = parse_page_message(r#"{"event":"imagesDiscovered","ids":[1,2,3]}"#)
            .expect("expected page event parse");
        assert_eq!(
            parsed,
            PageMessage::Event(PageEvent::ImagesDiscovered { ids: vec![1, 2, 3] })
        );
    }

    #[test]
    fn rejects_unrecognized_payload() {
        assert!(parse_page_message(r#"{"hello":"world"}"#).is_err());
        assert!(parse_page_message(r#"{"action":"selfDestruct"}"#).is_err());
        assert!(parse_page_message("not json").is_err());
    }

    #[test]
    fn acknowledgments_serialize_camel_case() {
        assert_eq!(
            serde_json::to_value(Response::Toggled {
                success: true,
                is_replacing: true,
            })
            .expect("serialize"),
            json!({"success": true, "isReplacing": true})
        );
        assert_eq!(
            serde_json::to_value(Response::Status {
                is_replacing: false,
            })
            .expect("serialize"),
            json!({"isReplacing": false})
        );
    }

    #[test]
    fn status_notice_round_trips_with_the_action_tag() {
        let notice = Notice::StatusChanged { is_replacing: true };
        let payload = serde_json::to_string(&notice).expect("serialize");
        assert_eq!(payload, r#"{"action":"statusChanged","isReplacing":true}"#);
        assert_eq!(
            serde_json::from_str::<Notice>(&payload).expect("parse"),
            notice
        );
    }
}
