//! Message decoding and body decomposition.

use mailparse::{MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};

use mailpress_core::{now_epoch, parse_date_epoch};

const TEXT_WRAP_COLS: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message has no Message-ID header")]
    MissingMessageId,
    #[error("malformed message: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Decoded header fields of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedHeader {
    /// Message id with the angle-bracket delimiters stripped.
    pub message_id: String,
    pub from: String,
    pub to: Option<String>,
    pub subject: String,
    pub date: Option<String>,
    /// Epoch seconds parsed from the `Date` header, "now" when absent.
    pub timestamp: f64,
}

/// Decode the headers of a raw message. Encoded words (RFC 2047) are
/// normalized by mailparse; a missing message id is the only fatal case.
pub fn decode_header(raw: &[u8]) -> Result<DecodedHeader> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| strip_angle_brackets(&v))
        .filter(|v| !v.is_empty())
        .ok_or(DecodeError::MissingMessageId)?;

    let from = headers.get_first_value("From").unwrap_or_default();
    let to = headers.get_first_value("To").filter(|v| !v.trim().is_empty());
    let subject = headers
        .get_first_value("Subject")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "(no subject)".to_string());
    let date = headers.get_first_value("Date").filter(|v| !v.trim().is_empty());
    let timestamp = date
        .as_deref()
        .and_then(parse_date_epoch)
        .unwrap_or_else(now_epoch);

    Ok(DecodedHeader {
        message_id,
        from,
        to,
        subject,
        date,
        timestamp,
    })
}

pub fn strip_angle_brackets(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// One extracted media attachment, filename already sanitized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPart {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Recognized `key: value` pairs from a leading front-matter block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontMatter {
    pub location: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl FrontMatter {
    /// Parse the `location` value as a `lat,lon` pair.
    pub fn lat_lon(&self) -> Option<(f64, f64)> {
        let raw = self.location.as_deref()?;
        let (lat, lon) = raw.split_once(',')?;
        Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub time: Option<String>,
}

/// A GPS route attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackData {
    pub points: Vec<TrackPoint>,
}

/// Transient per-message decomposition of the body parts.
#[derive(Debug, Clone, Default)]
pub struct Decomposition {
    /// Primary textual body, signature and front matter stripped.
    pub text_markdown: Option<String>,
    pub media: Vec<MediaPart>,
    pub track: Option<TrackData>,
    pub front_matter: FrontMatter,
    /// First surviving media filename, the gallery icon candidate.
    pub icon: Option<String>,
}

impl Decomposition {
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    pub fn has_geodata(&self) -> bool {
        self.track.is_some() || self.front_matter.lat_lon().is_some()
    }
}

/// Walk all body parts in document order and classify each one.
///
/// Text parts overwrite each other: the last text part wins. This mirrors
/// multipart/alternative messages where the final part is the preferred
/// representation.
pub fn decompose(raw: &[u8]) -> Result<Decomposition> {
    let parsed = mailparse::parse_mail(raw)?;
    let mut out = Decomposition::default();
    let mut index = 0usize;
    walk_leaves(&parsed, &mut |part| {
        classify_part(part, index, &mut out);
        index += 1;
    });
    Ok(out)
}

fn walk_leaves<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    if parsed.subparts.is_empty() {
        cb(parsed);
        return;
    }
    for part in &parsed.subparts {
        walk_leaves(part, cb);
    }
}

fn classify_part(part: &ParsedMail, index: usize, out: &mut Decomposition) {
    let mimetype = part.ctype.mimetype.to_lowercase();
    let parsed_mime: mime::Mime = mimetype
        .parse()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    let filename = part_filename(part);

    let top = parsed_mime.type_();
    if top == mime::TEXT {
        if is_track_file(filename.as_deref()) {
            match part.get_body_raw() {
                Ok(bytes) => out.track = parse_track(&bytes),
                Err(err) => {
                    tracing::warn!(%err, "could not read track attachment, dropped");
                }
            }
            return;
        }
        let body = match part.get_body() {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%err, "could not decode text part, skipped");
                return;
            }
        };
        let text = if parsed_mime.subtype() == mime::HTML {
            html_body_to_text(&body)
        } else {
            normalize_newlines(&body)
        };
        let text = strip_signature(&text);
        let (front_matter, text) = split_front_matter(&text);
        out.front_matter = front_matter;
        out.text_markdown = Some(text);
    } else if top == mime::IMAGE || top == mime::VIDEO {
        push_media(part, index, &mimetype, filename, out);
    } else if top == mime::APPLICATION && parsed_mime.subtype() == mime::OCTET_STREAM {
        // Unlabeled attachments: trust the filename.
        let guessed = filename
            .as_deref()
            .map(|name| mime_guess::from_path(name).first_or_octet_stream());
        if let Some(guessed) = guessed {
            let kind = guessed.type_();
            if kind == mime::IMAGE || kind == mime::VIDEO {
                let essence = guessed.essence_str().to_string();
                push_media(part, index, &essence, filename, out);
            }
        }
    }
}

fn push_media(
    part: &ParsedMail,
    index: usize,
    mimetype: &str,
    filename: Option<String>,
    out: &mut Decomposition,
) {
    let subtype = mimetype.rsplit_once('/').map(|(_, s)| s).unwrap_or("bin");
    let name = filename.unwrap_or_else(|| format!("part-{}.{}", index, subtype));
    let name = sanitize_media_filename(&name);
    if has_png_extension(&name) {
        tracing::warn!(filename = %name, "png attachments are not supported, dropped");
        return;
    }
    let bytes = match part.get_body_raw() {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(filename = %name, %err, "could not decode media part, dropped");
            return;
        }
    };
    if out.icon.is_none() {
        out.icon = Some(name.clone());
    }
    out.media.push(MediaPart {
        filename: name,
        mime: mimetype.to_string(),
        bytes,
    });
}

fn part_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn is_track_file(filename: Option<&str>) -> bool {
    filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.eq_ignore_ascii_case("gpx"))
        .unwrap_or(false)
}

fn html_body_to_text(body: &str) -> String {
    let sanitized = ammonia::Builder::default().clean(body).to_string();
    let text = html2text::from_read(sanitized.as_bytes(), TEXT_WRAP_COLS);
    let text = html_escape::decode_html_entities(&text).to_string();
    normalize_newlines(&text)
}

fn normalize_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Cut the body at the first signature marker line (`-- `). The newline
/// before the marker is kept, everything after is discarded.
fn strip_signature(text: &str) -> String {
    if text.starts_with("-- ") {
        return String::new();
    }
    match text.find("\n-- ") {
        Some(pos) => text[..pos + 1].to_string(),
        None => text.to_string(),
    }
}

/// Detect a leading `key: value` block terminated by a `---` line. Returns
/// the recognized keys and the remaining body. A body whose first lines do
/// not all parse as `key: value` is returned untouched.
fn split_front_matter(text: &str) -> (FrontMatter, String) {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut offset = 0usize;
    for line in text.split('\n') {
        let next_offset = offset + line.len() + 1;
        if line.starts_with("---") {
            if pairs.is_empty() {
                break;
            }
            let body = if next_offset >= text.len() {
                ""
            } else {
                &text[next_offset..]
            };
            let mut front_matter = FrontMatter::default();
            for (key, value) in pairs {
                match key.as_str() {
                    "location" => front_matter.location = Some(value),
                    "title" => front_matter.title = Some(value),
                    "author" => front_matter.author = Some(value),
                    _ => {}
                }
            }
            return (front_matter, body.to_string());
        }
        match parse_key_value(line) {
            Some(pair) => pairs.push(pair),
            None => break,
        }
        offset = next_offset;
    }
    (FrontMatter::default(), text.to_string())
}

fn parse_key_value(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim().to_string()))
}

/// Sanitize an attachment filename: whitespace and path separators become a
/// single hyphen, jpeg extension casings collapse to `.jpg`.
pub fn sanitize_media_filename(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_whitespace() || ch == '/' || ch == '\\' {
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
        } else {
            out.push(ch);
        }
    }
    match out.rsplit_once('.') {
        Some((stem, ext))
            if ext.eq_ignore_ascii_case("jpeg") || ext.eq_ignore_ascii_case("jpg") =>
        {
            format!("{}.jpg", stem)
        }
        _ => out,
    }
}

fn has_png_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

fn parse_track(bytes: &[u8]) -> Option<TrackData> {
    match gpx::read(bytes) {
        Ok(doc) => {
            let mut points = Vec::new();
            for track in &doc.tracks {
                for segment in &track.segments {
                    for waypoint in &segment.points {
                        let point = waypoint.point();
                        points.push(TrackPoint {
                            lat: point.y(),
                            lon: point.x(),
                            time: waypoint.time.as_ref().and_then(|t| t.format().ok()),
                        });
                    }
                }
            }
            if points.is_empty() {
                tracing::warn!("track attachment contains no points, dropped");
                return None;
            }
            Some(TrackData { points })
        }
        Err(err) => {
            tracing::warn!(%err, "could not parse track attachment, dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DecodeError, decompose, decode_header, sanitize_media_filename, split_front_matter,
        strip_signature,
    };

    const PLAIN: &[u8] = b"From: Alice Example <alice@example.com>\r\n\
Message-ID: <m1@host.example>\r\n\
Subject: Day one\r\n\
Date: Thu, 1 Jan 2026 00:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello\r\n\
-- \r\n\
Signature";

    #[test]
    fn decode_is_deterministic() {
        let first = decode_header(PLAIN).unwrap();
        let second = decode_header(PLAIN).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message_id, "m1@host.example");
        assert_eq!(first.subject, "Day one");
        assert_eq!(first.timestamp, 1767225600.0);
    }

    #[test]
    fn decode_normalizes_encoded_subject() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <enc@host>\r\n\
Subject: =?utf-8?B?QnLDvGNrZQ==?=\r\n\
\r\n\
Body";
        let header = decode_header(raw).unwrap();
        assert_eq!(header.subject, "Br\u{fc}cke");
    }

    #[test]
    fn decode_without_message_id_fails() {
        let raw = b"From: a@example.com\r\nSubject: x\r\n\r\nBody";
        assert!(matches!(
            decode_header(raw),
            Err(DecodeError::MissingMessageId)
        ));
    }

    #[test]
    fn decode_substitutes_missing_subject_and_date() {
        let raw = b"From: a@example.com\r\nMessage-ID: <d@host>\r\n\r\nBody";
        let header = decode_header(raw).unwrap();
        assert_eq!(header.subject, "(no subject)");
        assert!(header.date.is_none());
        assert!(header.timestamp > 0.0);
    }

    #[test]
    fn signature_is_stripped() {
        assert_eq!(strip_signature("Hello\n-- \nSignature"), "Hello\n");
        assert_eq!(strip_signature("-- \nonly signature"), "");
        assert_eq!(strip_signature("no marker\n---\nhr"), "no marker\n---\nhr");
    }

    #[test]
    fn front_matter_is_split_off() {
        let (fm, body) = split_front_matter("location: 45.0,9.0\n---\nBody text");
        assert_eq!(fm.location.as_deref(), Some("45.0,9.0"));
        assert_eq!(fm.lat_lon(), Some((45.0, 9.0)));
        assert_eq!(body, "Body text");
    }

    #[test]
    fn leading_rule_is_not_front_matter() {
        let (fm, body) = split_front_matter("---\njust markdown");
        assert_eq!(fm, super::FrontMatter::default());
        assert_eq!(body, "---\njust markdown");
    }

    #[test]
    fn decompose_strips_signature_from_plain_body() {
        let decomp = decompose(PLAIN).unwrap();
        assert_eq!(decomp.text_markdown.as_deref(), Some("Hello\n"));
        assert!(decomp.media.is_empty());
        assert!(!decomp.has_media());
    }

    #[test]
    fn decompose_extracts_front_matter() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <fm@host>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
location: 45.0,9.0\r\n\
---\r\n\
Body text";
        let decomp = decompose(raw).unwrap();
        assert_eq!(decomp.front_matter.location.as_deref(), Some("45.0,9.0"));
        assert_eq!(decomp.text_markdown.as_deref(), Some("Body text"));
        assert!(decomp.has_geodata());
    }

    #[test]
    fn last_text_part_wins() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <multi@host>\r\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
First\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Second\r\n\
--XYZ--\r\n";
        let decomp = decompose(raw).unwrap();
        assert_eq!(decomp.text_markdown.as_deref().map(str::trim_end), Some("Second"));
    }

    #[test]
    fn media_filenames_are_sanitized() {
        assert_eq!(sanitize_media_filename("IMG 001.JPEG"), "IMG-001.jpg");
        assert_eq!(sanitize_media_filename("a/b\\c.jpg"), "a-b-c.jpg");
        assert_eq!(sanitize_media_filename("clip.MOV"), "clip.MOV");
    }

    #[test]
    fn decompose_collects_media_and_icon() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <media@host>\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Body\r\n\
--XYZ\r\n\
Content-Type: image/jpeg\r\n\
Content-Disposition: attachment; filename=\"IMG 001.JPEG\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
/9j/4AAQ\r\n\
--XYZ--\r\n";
        let decomp = decompose(raw).unwrap();
        assert_eq!(decomp.media.len(), 1);
        assert_eq!(decomp.media[0].filename, "IMG-001.jpg");
        assert!(!decomp.media[0].bytes.is_empty());
        assert_eq!(decomp.icon.as_deref(), Some("IMG-001.jpg"));
        assert!(decomp.has_media());
    }

    #[test]
    fn png_parts_are_dropped_without_media_signal() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <png@host>\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Body\r\n\
--XYZ\r\n\
Content-Type: image/png\r\n\
Content-Disposition: attachment; filename=\"photo.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0K\r\n\
--XYZ--\r\n";
        let decomp = decompose(raw).unwrap();
        assert!(decomp.media.is_empty());
        assert!(decomp.icon.is_none());
        assert!(!decomp.has_media());
    }

    #[test]
    fn track_attachment_is_parsed_not_treated_as_text() {
        let raw = b"From: a@example.com\r\n\
Message-ID: <gpx@host>\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Ride report\r\n\
--XYZ\r\n\
Content-Type: text/xml\r\n\
Content-Disposition: attachment; filename=\"route.gpx\"\r\n\
\r\n\
<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
<gpx version=\"1.1\" creator=\"test\" xmlns=\"http://www.topografix.com/GPX/1/1\">\r\n\
<trk><trkseg>\r\n\
<trkpt lat=\"45.0\" lon=\"9.0\"></trkpt>\r\n\
<trkpt lat=\"45.1\" lon=\"9.1\"></trkpt>\r\n\
</trkseg></trk></gpx>\r\n\
--XYZ--\r\n";
        let decomp = decompose(raw).unwrap();
        assert_eq!(decomp.text_markdown.as_deref().map(str::trim_end), Some("Ride report"));
        let track = decomp.track.as_ref().expect("track parsed");
        assert_eq!(track.points.len(), 2);
        assert_eq!(track.points[0].lat, 45.0);
        assert_eq!(track.points[0].lon, 9.0);
        assert!(decomp.has_geodata());
    }
}
