//! Opaque single-use credentials minted by the server.

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};

fn random_token() -> String {
	let mut bytes = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut bytes);
	BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

macro_rules! make_token {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        $vis struct $ident(String);

        impl $ident {
            pub fn mint() -> Self {
                Self(random_token())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $ident {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    )*}
}

make_token! {
	/// Resolves to exactly one session in grace, until the grace deadline.
	pub struct ReconnectionToken;

	/// Confirms the kick of a caller's own existing session during admission.
	pub struct ReplacementToken;
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn minted_tokens_are_unique_and_url_safe() {
		let a = ReconnectionToken::mint();
		let b = ReconnectionToken::mint();
		assert_ne!(a, b);
		assert!(!a.as_str().contains(['+', '/', '=']));
		// 32 bytes of entropy, unpadded.
		assert_eq!(a.as_str().len(), 43);
	}
}
