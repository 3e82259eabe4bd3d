//! Turns a framed adapter reply into a compact hex/text string.

/// Strip whitespace, line endings and the prompt, then drop ISO-TP segment
/// markers (`0:`, `1:` ... `F:`).
///
/// ```
/// use obdhub_elm327_lib::normalize;
///
/// assert_eq!(normalize(b"0: 62 01 01 EF\r1: FB E7\r\r>"), "620101EFFBE7");
/// ```
pub fn normalize(reply: &[u8]) -> String {
    let text = String::from_utf8_lossy(reply);
    let compact: Vec<char> = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '\r' | '\n' | '>'))
        .collect();

    let mut out = String::with_capacity(compact.len());
    let mut i = 0;
    while i < compact.len() {
        if compact[i].is_ascii_hexdigit() && compact.get(i + 1) == Some(&':') {
            i += 2;
            continue;
        }
        out.push(compact[i]);
        i += 1;
    }
    out
}
