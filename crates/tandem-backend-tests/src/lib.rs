pub mod suite;

/// Expands the conformance suite into `#[test]` functions for one driver.
///
/// `$register` runs before every test so drivers linked only as dev-dependencies are present.
#[macro_export]
macro_rules! define_device_tests {
    ($module:ident, $query:expr, $register:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::suite;

            macro_rules! device_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        ($register)();
                        suite::$name($query);
                    }
                };
            }

            device_test!(allocate_and_read_back);
            device_test!(host_visible_buffers_read_back);
            device_test!(allocate_rejects_wrong_byte_length);
            device_test!(read_past_end_is_size_mismatch);
            device_test!(overflowing_shape_is_rejected);
            device_test!(boolean_buffers_keep_their_bytes);
            device_test!(storage_only_dtypes_round_trip);
            device_test!(simple_mul_matches_expected);
            device_test!(matmul_and_reduce_match_expected);
            device_test!(integer_relu_matches_expected);
            device_test!(random_elementwise_matches_host);
            device_test!(outputs_pop_in_order_then_exhaust);
            device_test!(outputs_outlive_their_call);
            device_test!(foreign_buffer_is_device_mismatch);
            device_test!(wrong_arity_fails_the_call);
            device_test!(unknown_entry_point_is_reported);
            device_test!(module_for_other_driver_is_rejected);
            device_test!(garbage_module_is_rejected);
            device_test!(resolving_unknown_driver_fails);
        }
    };
}
