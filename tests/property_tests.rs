/// Property-based tests using proptest.
/// Tests invariants that should hold for all inputs.
use proptest::prelude::*;

use lead_intake_api::formatting::{
    capitalize_name, format_phone_number, TransformParams, INVALID_NUMBER,
};

proptest! {
    #[test]
    fn phone_formatting_never_panics(input in "\\PC*", region in "[A-Z]{2}") {
        let _ = format_phone_number(&input, &region);
    }

    // Output is either the sentinel or canonical `+<country>-<national>`.
    #[test]
    fn phone_output_is_sentinel_or_canonical(input in "\\PC*") {
        let output = format_phone_number(&input, "IN");
        if output != INVALID_NUMBER {
            prop_assert!(output.starts_with('+'));
            let rest = &output[1..];
            prop_assert!(rest.contains('-'));
            prop_assert!(rest.chars().all(|c| c.is_ascii_digit() || c == '-'));
        }
    }

    // Valid Indian mobile numbers normalize the same with or without the
    // country prefix.
    #[test]
    fn phone_prefix_forms_agree(national in "98[0-9]{8}") {
        let bare = format_phone_number(&national, "IN");
        let prefixed = format_phone_number(&format!("+91{}", national), "IN");
        let redundant = format_phone_number(&format!("91{}", national), "IN");
        prop_assert_eq!(&bare, &prefixed);
        prop_assert_eq!(&bare, &redundant);
    }

    #[test]
    fn capitalize_never_panics(input in "\\PC*") {
        let _ = capitalize_name(&input);
    }

    // ASCII names are stable under repeated capitalization.
    #[test]
    fn capitalize_ascii_idempotent(input in "[a-zA-Z ]{0,40}") {
        let once = capitalize_name(&input);
        let twice = capitalize_name(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn transform_params_parse_never_panics(input in "\\PC*") {
        let params = TransformParams::parse(Some(&input));
        let _ = params.get(0, "anything");
    }
}
