//! Refer-To construction for attended transfer (RFC 3891 Replaces)

use url::form_urlencoded;

use crate::stack::DialogId;

/// The Replaces value identifying the consultation dialog, unencoded
///
/// Tags are written from the target's point of view, which is how the
/// transferee's INVITE will present them: our remote tag is the target's
/// local tag (`to-tag`) and our local tag is `from-tag`.
pub fn replaces_value(dialog: &DialogId) -> String {
    format!(
        "{};to-tag={};from-tag={}",
        dialog.call_id, dialog.remote_tag, dialog.local_tag
    )
}

/// `<target>?Replaces=<url-encoded replaces value>`
pub fn refer_to_with_replaces(target: &str, consultation: &DialogId) -> String {
    let target = target.trim().trim_start_matches('<').trim_end_matches('>');
    let encoded: String = form_urlencoded::byte_serialize(replaces_value(consultation).as_bytes()).collect();
    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{}{}Replaces={}", target, separator, encoded)
}
