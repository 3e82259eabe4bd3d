//! Sorting normalized replies by shape.
//!
//! Order matters: a reply is checked against each class in turn and the
//! first that fits wins. Raw-text PIDs are matched by the engine between
//! [`ReplyClass::AtAck`] and the typed classes since they are not mutually
//! exclusive with them.

const ADAPTER_ERRORS: [&str; 4] = ["NODATA", "ERROR", "UNABLE", "STOPPED"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// `NO DATA`, `?ERROR`, `UNABLE TO CONNECT`, `STOPPED`
    AdapterError,
    /// `OK` or an echoed AT command
    AtAck,
    /// Mode 03
    Dtc,
    /// `ATRV`
    Voltage,
    Mode01,
    /// Mode 22 with no typed decoder
    ExtendedData,
    Unrecognized,
}

/// True when the reply is an adapter-level failure.
pub fn is_adapter_error(clean: &str) -> bool {
    ADAPTER_ERRORS.iter().any(|e| clean.contains(e))
}

/// True for the acknowledgement and echo replies that carry no data.
pub fn is_at_ack(clean: &str) -> bool {
    clean == "OK" || clean.starts_with("AT")
}

/// Classify the data-bearing part of a reply.
pub fn classify(clean: &str) -> ReplyClass {
    if is_adapter_error(clean) {
        ReplyClass::AdapterError
    } else if is_at_ack(clean) {
        ReplyClass::AtAck
    } else if clean.contains("43") {
        ReplyClass::Dtc
    } else if clean.contains('V') && !clean.contains("41") {
        ReplyClass::Voltage
    } else if clean.contains("41") {
        ReplyClass::Mode01
    } else if clean.contains("62") {
        ReplyClass::ExtendedData
    } else {
        ReplyClass::Unrecognized
    }
}
