pub use enclose::*;

/// Builds a `Vec<Input>` from anything convertible into [`crate::Input`].
#[macro_export]
macro_rules! inputs {
	() => { ::std::vec::Vec::<$crate::Input>::new() };
	($($item:expr),+ $(,)?) => { vec![$($crate::Input::from($item)),+] };
}
