use http::Request;

pub const CRITICALITY: &str = "X-Request-Criticality";
pub const CAN_WAIT: &str = "X-Can-Wait";

// Criticality levels follow https://sre.google/sre-book/handling-overload/
pub const CRITICAL_PLUS: &str = "CRITICAL_PLUS";
pub const CRITICAL: &str = "CRITICAL";
/// Used when the client does not set the `X-Request-Criticality` header.
pub const CRITICALITY_DEFAULT: &str = CRITICAL;

/// The request's declared criticality, falling back to the default when the
/// header is missing, empty, or not valid UTF-8.
pub fn criticality<B>(request: &Request<B>) -> &str {
    match request
        .headers()
        .get(CRITICALITY)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if !value.is_empty() => value,
        _ => CRITICALITY_DEFAULT,
    }
}
