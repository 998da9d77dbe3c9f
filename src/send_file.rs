//! Reverse-proxy send-file strategy
//!
//! When a response uses the `!STATICFILE` sentinel the server normally reads
//! the file into memory itself. Behind a front proxy it is cheaper to let the
//! proxy serve the file: [`AccelRedirect`] rewrites the response into an
//! `X-Accel-Redirect` header and an empty body for every path inside its
//! allow-list.

use crate::context::RequestContext;
use crate::hooks::SendFileHook;

/// Send-file strategy emitting `X-Accel-Redirect` headers for allow-listed
/// path prefixes
#[derive(Debug, Clone, Default)]
pub struct AccelRedirect {
    prefixes: Vec<String>,
}

impl AccelRedirect {
    /// Creates a strategy with the given allow-list of path prefixes.
    /// Matching is a case-sensitive left match.
    #[must_use]
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Rewrites `ctx` when its file path starts with an allowed prefix.
    /// Returns false to decline, letting the server read the file directly.
    pub fn handle(&self, ctx: &mut RequestContext) -> bool {
        let path = match std::str::from_utf8(&ctx.out_content) {
            Ok(path) => path,
            Err(_) => return false,
        };

        let stripped = match self
            .prefixes
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix.as_str()))
        {
            Some(stripped) => stripped.to_owned(),
            None => return false,
        };

        if !ctx.out_custom_headers.is_empty() && !ctx.out_custom_headers.ends_with('\n') {
            ctx.out_custom_headers.push_str("\r\n");
        }
        ctx.out_custom_headers.push_str("X-Accel-Redirect: ");
        ctx.out_custom_headers.push_str(&stripped);
        ctx.out_custom_headers.push_str("\r\n");
        ctx.out_content.clear();

        true
    }

    /// Wraps the strategy into a [`SendFileHook`]
    #[must_use]
    pub fn into_hook(self) -> SendFileHook {
        std::sync::Arc::new(move |ctx| self.handle(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::AccelRedirect;
    use crate::context::RequestContext;

    #[test]
    fn allowed_prefix_is_stripped() {
        let strategy = AccelRedirect::new(["/var/www"]);
        let mut ctx = RequestContext {
            out_content: b"/var/www/static/a.bin".to_vec(),
            ..RequestContext::default()
        };

        assert!(strategy.handle(&mut ctx));
        assert!(ctx
            .out_custom_headers
            .contains("X-Accel-Redirect: /static/a.bin\r\n"));
        assert!(ctx.out_content.is_empty());
    }

    #[test]
    fn match_is_case_sensitive() {
        let strategy = AccelRedirect::new(["/var/www"]);
        let mut ctx = RequestContext {
            out_content: b"/Var/Www/a.bin".to_vec(),
            ..RequestContext::default()
        };

        assert!(!strategy.handle(&mut ctx));
        assert_eq!(ctx.out_content, b"/Var/Www/a.bin");
    }

    #[test]
    fn declines_outside_allow_list() {
        let strategy = AccelRedirect::new(["/var/www", "/srv/data"]);
        let mut ctx = RequestContext {
            out_content: b"/etc/passwd".to_vec(),
            ..RequestContext::default()
        };

        assert!(!strategy.handle(&mut ctx));
        assert!(ctx.out_custom_headers.is_empty());
    }

    #[test]
    fn appends_after_existing_custom_headers() {
        let strategy = AccelRedirect::new(["/data"]);
        let mut ctx = RequestContext {
            out_content: b"/data/x".to_vec(),
            out_custom_headers: "Cache-Control: no-store".to_owned(),
            ..RequestContext::default()
        };

        assert!(strategy.handle(&mut ctx));
        assert!(ctx
            .out_custom_headers
            .contains("Cache-Control: no-store\r\nX-Accel-Redirect: /x\r\n"));
    }
}
