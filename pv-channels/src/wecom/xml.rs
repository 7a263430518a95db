use super::WecomTextMessage;
use anyhow::{Result, anyhow};
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use std::collections::HashMap;

/// Flattens a one-level WeCom XML document into `tag -> text`.
pub fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut output = HashMap::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|_| anyhow!("wecom xml text decode failed"))?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("wecom xml parse failed: {err}")),
            _ => {}
        }
        buffer.clear();
    }
    Ok(output)
}

/// The `<Encrypt>` field of a callback envelope, if present.
pub fn extract_encrypt(xml: &str) -> Result<Option<String>> {
    let mut fields = parse_xml_fields(xml)?;
    Ok(fields.remove("Encrypt"))
}

/// Parses a decrypted callback message. Non-text messages yield `None`.
pub fn parse_text_message(xml: &str) -> Result<Option<WecomTextMessage>> {
    let mut fields = parse_xml_fields(xml)?;
    let msg_type = fields
        .get("MsgType")
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if msg_type != "text" {
        return Ok(None);
    }
    let Some(content) = fields.remove("Content") else {
        return Ok(None);
    };

    let from_user = fields
        .remove("FromUserName")
        .ok_or_else(|| anyhow!("invalid wecom payload: missing FromUserName"))?;
    Ok(Some(WecomTextMessage {
        from_user,
        to_user: fields.remove("ToUserName").unwrap_or_default(),
        content,
        msg_id: fields.remove("MsgId").or_else(|| fields.remove("MsgID")),
        agent_id: fields.remove("AgentID"),
        create_time: fields
            .get("CreateTime")
            .and_then(|value| value.trim().parse::<i64>().ok()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xml_fields_reads_text_and_cdata() {
        let xml = "<xml><MsgType><![CDATA[text]]></MsgType><CreateTime>1710000000</CreateTime></xml>";
        let fields = parse_xml_fields(xml).expect("xml should parse");
        assert_eq!(fields.get("MsgType").map(String::as_str), Some("text"));
        assert_eq!(fields.get("CreateTime").map(String::as_str), Some("1710000000"));
    }

    #[test]
    fn text_message_maps_all_fields() {
        let xml = "<xml><ToUserName><![CDATA[corp]]></ToUserName><FromUserName><![CDATA[zhangsan]]></FromUserName><CreateTime>1710000000</CreateTime><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[你好]]></Content><MsgId>42</MsgId><AgentID>1000002</AgentID></xml>";
        let msg = parse_text_message(xml)
            .expect("parse")
            .expect("text message");
        assert_eq!(msg.from_user, "zhangsan");
        assert_eq!(msg.to_user, "corp");
        assert_eq!(msg.content, "你好");
        assert_eq!(msg.msg_id.as_deref(), Some("42"));
        assert_eq!(msg.agent_id.as_deref(), Some("1000002"));
        assert_eq!(msg.create_time, Some(1_710_000_000));
    }

    #[test]
    fn non_text_messages_are_skipped() {
        let xml = "<xml><FromUserName>u1</FromUserName><MsgType>event</MsgType><Event>enter_agent</Event></xml>";
        assert!(parse_text_message(xml).expect("parse").is_none());
    }

    #[test]
    fn envelope_encrypt_is_extracted() {
        let xml = "<xml><ToUserName><![CDATA[corp]]></ToUserName><Encrypt><![CDATA[abc==]]></Encrypt></xml>";
        assert_eq!(extract_encrypt(xml).expect("parse").as_deref(), Some("abc=="));
        assert_eq!(extract_encrypt("<xml></xml>").expect("parse"), None);
    }
}
