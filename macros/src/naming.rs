//! Compile-time checks on broker-visible type names

/// Longest type name that still yields a valid `Subscription_<name>`.
pub const MAX_TYPE_NAME_LEN: usize = 260 - "Subscription_".len();

/// Check that `name` can be embedded in topic and subscription names.
///
/// Mirrors the runtime validation in `typed_pubsub::message` so mistakes
/// surface at compile time.
pub fn validate_type_name(name: &str) -> Result<(), String> {
	if name.is_empty() {
		return Err("bus message name must not be empty".to_string());
	}
	if let Some(bad) = name
		.chars()
		.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
	{
		return Err(format!(
			"character {bad:?} is not allowed in bus message names; use ASCII \
			 letters, digits, '.', '-' or '_'"
		));
	}
	if name.len() > MAX_TYPE_NAME_LEN {
		return Err(format!(
			"bus message name is longer than {MAX_TYPE_NAME_LEN} characters"
		));
	}
	Ok(())
}

/// Strip the raw identifier prefix so `r#type` maps to `type`.
pub fn unraw(ident: &syn::Ident) -> String {
	let name = ident.to_string();
	match name.strip_prefix("r#") {
		| Some(stripped) => stripped.to_string(),
		| None => name,
	}
}
