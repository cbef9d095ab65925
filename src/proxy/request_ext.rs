use hyper::header::{AsHeaderName, AUTHORIZATION};
use hyper::http::request::Parts;
use hyper::HeaderMap;

pub trait HeaderExt {
    fn get_header<K: AsHeaderName>(&self, header: K) -> Option<String>;
    fn bearer_token(&self) -> Option<String>;
}

impl HeaderExt for HeaderMap {
    fn get_header<K>(&self, header: K) -> Option<String>
    where
        K: AsHeaderName,
    {
        self.get(header)
            .and_then(|header| header.to_str().ok())
            .map(ToString::to_string)
    }

    fn bearer_token(&self) -> Option<String> {
        let authorization = self.get_header(AUTHORIZATION)?;
        let (scheme, token) = authorization.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

impl HeaderExt for Parts {
    fn get_header<K>(&self, header: K) -> Option<String>
    where
        K: AsHeaderName,
    {
        self.headers.get_header(header)
    }

    fn bearer_token(&self) -> Option<String> {
        self.headers.bearer_token()
    }
}
