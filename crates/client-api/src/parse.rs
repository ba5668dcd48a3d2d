//! Envelope extraction from the many shapes a request can take.

use axum::extract::Multipart;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use toto_lib::envelope::Envelope;
use toto_lib::wire::WireFormat;

/// How the response body should be rendered for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Wire(WireFormat),
}

impl ResponseType {
    pub fn mime(self) -> &'static str {
        match self {
            ResponseType::Wire(format) => format.mime(),
        }
    }
}

/// A request body failed to parse; reported as HTTP 400.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

pub fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_owned()
}

/// Parse a POST body into an envelope according to its content type.
/// Returns the envelope and the response type mirroring the request.
pub async fn parse_post_body(
    headers: &HeaderMap,
    body: Bytes,
    msgpack_enabled: bool,
) -> Result<(Envelope, ResponseType), ParseError> {
    let content_type = content_type(headers);
    let default_response = ResponseType::Wire(WireFormat::Json);

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let parameters = form_parameters(&body)?;
        return Ok((
            Envelope {
                parameters,
                ..Envelope::default()
            },
            default_response,
        ));
    }
    if content_type.starts_with("multipart/form-data") {
        let parameters = multipart_parameters(headers, body).await?;
        return Ok((
            Envelope {
                parameters,
                ..Envelope::default()
            },
            default_response,
        ));
    }
    if msgpack_enabled && content_type.starts_with("application/msgpack") {
        let envelope = WireFormat::MsgPack
            .decode(&body)
            .map_err(|e| ParseError(e.to_string()))?;
        return Ok((envelope, ResponseType::Wire(WireFormat::MsgPack)));
    }
    // JSON is the default for anything else, matching the original server.
    if body.is_empty() {
        return Ok((Envelope::default(), default_response));
    }
    let envelope = WireFormat::Json
        .decode(&body)
        .map_err(|e| ParseError(e.to_string()))?;
    Ok((envelope, default_response))
}

/// Form bodies become a parameters map of string lists, one entry per
/// repeated key.
fn form_parameters(body: &[u8]) -> Result<Map<String, Value>, ParseError> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(body).map_err(|e| ParseError(e.to_string()))?;
    let mut parameters = Map::new();
    for (key, value) in pairs {
        match parameters
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(values) => values.push(Value::String(value)),
            _ => unreachable!(),
        }
    }
    Ok(parameters)
}

/// Multipart bodies become `{arguments, files}`; file bodies are carried
/// base64 encoded.
async fn multipart_parameters(
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Map<String, Value>, ParseError> {
    use axum::extract::FromRequest;

    let mut request = axum::http::Request::new(axum::body::Body::from(body));
    *request.headers_mut() = headers.clone();
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ParseError(e.to_string()))?;

    let mut arguments = Map::new();
    let mut files = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ParseError(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        let filename = field.file_name().map(str::to_owned);
        let field_content_type = field.content_type().map(str::to_owned);
        let data = field.bytes().await.map_err(|e| ParseError(e.to_string()))?;
        match filename {
            Some(filename) => {
                let entry = json!({
                    "filename": filename,
                    "content_type": field_content_type,
                    "body": STANDARD.encode(&data),
                });
                match files
                    .entry(name)
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(values) => values.push(entry),
                    _ => unreachable!(),
                }
            }
            None => {
                let text = String::from_utf8_lossy(&data).into_owned();
                match arguments
                    .entry(name)
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(values) => values.push(Value::String(text)),
                    _ => unreachable!(),
                }
            }
        }
    }

    let mut parameters = Map::new();
    parameters.insert("arguments".into(), Value::Object(arguments));
    parameters.insert("files".into(), Value::Object(files));
    Ok(parameters)
}

/// Query arguments become parameters; single values flatten to scalar
/// strings, repeated keys stay lists.
pub fn query_parameters(query: Option<&str>) -> Result<Map<String, Value>, ParseError> {
    let Some(query) = query else {
        return Ok(Map::new());
    };
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(query).map_err(|e| ParseError(e.to_string()))?;
    let mut grouped: Map<String, Value> = Map::new();
    for (key, value) in pairs {
        match grouped
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(values) => values.push(Value::String(value)),
            _ => unreachable!(),
        }
    }
    for value in grouped.values_mut() {
        let flattened = match value {
            Value::Array(values) if values.len() == 1 => Some(values.remove(0)),
            _ => None,
        };
        if let Some(flattened) = flattened {
            *value = flattened;
        }
    }
    Ok(grouped)
}

/// Split a URL path into dotted method segments.
pub fn method_from_path(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.split('/').collect::<Vec<_>>().join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_bodies_parse_with_defaults() {
        let headers = HeaderMap::new();
        let (envelope, response_type) = parse_post_body(
            &headers,
            Bytes::from_static(br#"{"method":"a.b","parameters":{"x":1}}"#),
            false,
        )
        .await
        .unwrap();
        assert_eq!(envelope.method.as_deref(), Some("a.b"));
        assert_eq!(response_type, ResponseType::Wire(WireFormat::Json));
    }

    #[tokio::test]
    async fn form_bodies_become_list_parameters() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            "application/x-www-form-urlencoded".parse().unwrap(),
        );
        let (envelope, _) = parse_post_body(&headers, Bytes::from_static(b"arg1=1&arg2=hello"), false)
            .await
            .unwrap();
        assert_eq!(envelope.parameters["arg1"], json!(["1"]));
        assert_eq!(envelope.parameters["arg2"], json!(["hello"]));
    }

    #[tokio::test]
    async fn msgpack_requires_the_flag() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/msgpack".parse().unwrap());
        let envelope = Envelope::call("m", Map::new());
        let body = Bytes::from(WireFormat::MsgPack.encode(&envelope).unwrap());

        let (parsed, response_type) = parse_post_body(&headers, body.clone(), true).await.unwrap();
        assert_eq!(parsed.method.as_deref(), Some("m"));
        assert_eq!(response_type, ResponseType::Wire(WireFormat::MsgPack));

        // Disabled: the body is treated as JSON and fails to parse.
        assert!(parse_post_body(&headers, body, false).await.is_err());
    }

    #[test]
    fn query_single_values_flatten() {
        let parameters = query_parameters(Some("arg1=1&arg2=hello&multi=a&multi=b")).unwrap();
        assert_eq!(parameters["arg1"], "1");
        assert_eq!(parameters["arg2"], "hello");
        assert_eq!(parameters["multi"], json!(["a", "b"]));
    }

    #[test]
    fn paths_map_to_dotted_methods() {
        assert_eq!(method_from_path("/a/b/c").as_deref(), Some("a.b.c"));
        assert_eq!(method_from_path("return_value").as_deref(), Some("return_value"));
        assert_eq!(method_from_path("/"), None);
    }
}
