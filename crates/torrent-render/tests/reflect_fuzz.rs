// SPDX-License-Identifier: CEPL-1.0
use proptest::prelude::*;
use torrent_render::reflect::{reflect, ReflectError, SPIRV_MAGIC};

fn module(vars: &[(u32, u32)]) -> Vec<u32> {
    let bound = 16 + vars.len() as u32;
    let mut code = vec![SPIRV_MAGIC, 0x0001_0500, 0, bound, 0];
    // OpEntryPoint GLCompute %1
    code.extend([(4 << 16) | 15, 5, 1, 0]);
    for (k, &(binding, _)) in vars.iter().enumerate() {
        code.extend([(4 << 16) | 71, 16 + k as u32, 34, 0]);
        code.extend([(4 << 16) | 71, 16 + k as u32, 33, binding]);
    }
    for (k, &(_, class)) in vars.iter().enumerate() {
        code.extend([(4 << 16) | 59, 2, 16 + k as u32, class]);
    }
    code
}

proptest! {
    #[test]
    fn arbitrary_words_never_panic(body in prop::collection::vec(any::<u32>(), 0..256), bound in 0u32..64) {
        let mut code = vec![SPIRV_MAGIC, 0x0001_0500, 0, bound, 0];
        code.extend(body);
        let _ = reflect(&code);
    }

    #[test]
    fn mask_is_exactly_the_declared_buffer_bindings(
        vars in prop::collection::vec((0u32..40, prop::sample::select(vec![1u32, 2, 7, 9, 12])), 0..12)
    ) {
        let buffers: Vec<u32> = vars
            .iter()
            .filter(|(_, class)| *class == 2 || *class == 12)
            .map(|(b, _)| *b)
            .collect();

        match reflect(&module(&vars)) {
            Ok(iface) => {
                let expected = buffers.iter().fold(0u32, |m, b| m | (1 << b));
                prop_assert_eq!(iface.storage_buffers, expected);
                prop_assert_eq!(iface.storage_buffers.count_ones() as usize, buffers.len());
                prop_assert_eq!(iface.push_constants, vars.iter().any(|(_, c)| *c == 9));
            }
            Err(ReflectError::BindingOutOfRange(b)) => prop_assert!(b >= 32 && buffers.contains(&b)),
            Err(ReflectError::DuplicateBinding(b)) => {
                prop_assert!(buffers.iter().filter(|&&x| x == b).count() >= 2)
            }
            Err(e) => prop_assert!(false, "unexpected error {e}"),
        }
    }
}
