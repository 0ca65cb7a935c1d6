//! Input analysis for the `BusMessage` derive
//!
//! Resolves the broker-visible name from the type identifier and the
//! optional `#[bus_message(name = "...")]` attribute.

use syn::LitStr;

use crate::naming::{unraw, validate_type_name};

/// Everything code generation needs to know about the input type
#[derive(Debug, PartialEq, Eq)]
pub struct MessageAnalysis {
	/// Value of `BusMessage::TYPE_NAME`
	pub type_name: String,
}

impl MessageAnalysis {
	/// Analyze a derive input.
	///
	/// # Validation Rules
	/// 1. At most one `name` across all `bus_message` attributes
	/// 2. Only the `name` key is recognised
	/// 3. The resolved name passes [`validate_type_name`]
	pub fn analyze(input: &syn::DeriveInput) -> Result<Self, syn::Error> {
		let mut explicit: Option<LitStr> = None;

		let attrs = input.attrs.iter().filter(|a| a.path().is_ident("bus_message"));
		for attr in attrs {
			attr.parse_nested_meta(|meta| {
				if meta.path.is_ident("name") {
					if explicit.is_some() {
						return Err(meta.error("duplicate `name` in bus_message"));
					}
					explicit = Some(meta.value()?.parse()?);
					Ok(())
				} else {
					Err(meta.error(
						"unsupported bus_message attribute, expected `name = \"...\"`",
					))
				}
			})?;
		}

		let (type_name, span) = match &explicit {
			| Some(lit) => (lit.value(), lit.span()),
			| None => (unraw(&input.ident), input.ident.span()),
		};
		validate_type_name(&type_name).map_err(|msg| syn::Error::new(span, msg))?;

		Ok(Self { type_name })
	}
}
