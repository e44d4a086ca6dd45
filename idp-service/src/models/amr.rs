//! Authentication method references and the assurance level derived from them.

pub const AMR_PWD: &str = "pwd";
pub const AMR_MFA: &str = "mfa";
pub const AMR_GOOGLE: &str = "google";

pub const ACR_LOA1: &str = "urn:hellojohn:loa:1";
pub const ACR_LOA2: &str = "urn:hellojohn:loa:2";

/// `loa:2` once a second factor is present.
pub fn acr_for(amr: &[String]) -> &'static str {
    if amr.iter().any(|m| m == AMR_MFA) {
        ACR_LOA2
    } else {
        ACR_LOA1
    }
}

/// Appends `mfa` once, keeping the primary factor first.
pub fn with_mfa(amr: &[String]) -> Vec<String> {
    let mut out = amr.to_vec();
    if !out.iter().any(|m| m == AMR_MFA) {
        out.push(AMR_MFA.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acr_tracks_mfa() {
        let pwd = vec![AMR_PWD.to_string()];
        assert_eq!(acr_for(&pwd), ACR_LOA1);
        let elevated = with_mfa(&pwd);
        assert_eq!(elevated, vec!["pwd", "mfa"]);
        assert_eq!(acr_for(&elevated), ACR_LOA2);
        assert_eq!(with_mfa(&elevated), elevated);
    }
}
