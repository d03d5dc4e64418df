use futures::StreamExt;
use hyper::Body;

/// Read a request body, refusing anything larger than `max_bytes`
pub async fn read_body_limited(body: Body, max_bytes: usize) -> Result<Vec<u8>, String> {
    let mut result = Vec::new();
    let mut stream = body;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| format!("Error reading body: {}", e))?;
        if result.len() + chunk.len() > max_bytes {
            return Err(format!(
                "Request body size exceeds maximum allowed {} bytes",
                max_bytes
            ));
        }
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

/// First value of a form field in an urlencoded body or query string
pub fn form_field(encoded: &[u8], name: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
