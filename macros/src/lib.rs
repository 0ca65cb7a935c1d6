//! Derive macro for `typed_pubsub::BusMessage`.
//!
//! ```rust
//! use typed_pubsub::BusMessage;
//!
//! #[derive(BusMessage)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! assert_eq!(OrderPlaced::TYPE_NAME, "OrderPlaced");
//! ```
//!
//! The broker-visible name defaults to the bare type identifier and can be
//! pinned with `#[bus_message(name = "...")]`, which keeps a renamed type
//! attached to its existing topic.

mod analysis;
mod codegen;
mod naming;

use proc_macro::TokenStream;
use syn::parse_macro_input;

use crate::{analysis::MessageAnalysis, codegen::generate_bus_message_impl};

#[proc_macro_derive(BusMessage, attributes(bus_message))]
pub fn derive_bus_message(input: TokenStream) -> TokenStream {
	let input = parse_macro_input!(input as syn::DeriveInput);

	let result = MessageAnalysis::analyze(&input)
		.map(|analysis| generate_bus_message_impl(&input, &analysis));
	match result {
		| Ok(tokens) => tokens.into(),
		| Err(err) => err.to_compile_error().into(),
	}
}
