//! Code generation for the `BusMessage` derive

use proc_macro2::TokenStream;
use quote::quote;

use crate::analysis::MessageAnalysis;

/// `impl ::typed_pubsub::BusMessage for <input>`
pub fn generate_bus_message_impl(
	input: &syn::DeriveInput,
	analysis: &MessageAnalysis,
) -> TokenStream {
	let ident = &input.ident;
	let type_name = &analysis.type_name;
	let (impl_generics, ty_generics, where_clause) =
		input.generics.split_for_impl();

	quote! {
		impl #impl_generics ::typed_pubsub::BusMessage for #ident #ty_generics
		#where_clause
		{
			const TYPE_NAME: &'static str = #type_name;
		}
	}
}

#[cfg(test)]
mod tests {
	use syn::parse_quote;

	use super::*;

	fn generate(input: syn::DeriveInput) -> String {
		let analysis = MessageAnalysis::analyze(&input).unwrap();
		generate_bus_message_impl(&input, &analysis).to_string()
	}

	#[test]
	fn emits_type_name_constant() {
		let code = generate(parse_quote! { struct SimpleMessage; });
		assert!(code.contains(":: typed_pubsub :: BusMessage for SimpleMessage"));
		assert!(code.contains("const TYPE_NAME : & 'static str = \"SimpleMessage\""));
	}

	#[test]
	fn carries_generics_and_where_clause() {
		let code = generate(parse_quote! {
			#[bus_message(name = "Envelope")]
			struct Envelope<T> where T: Clone { inner: T }
		});
		assert!(code.contains("impl < T > :: typed_pubsub :: BusMessage for Envelope < T >"));
		assert!(code.contains("where T : Clone"));
		assert!(code.contains("\"Envelope\""));
	}
}
