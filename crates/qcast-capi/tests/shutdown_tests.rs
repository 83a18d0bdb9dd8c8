//! Engine teardown through the C ABI. Kept in its own binary: shutdown
//! replaces the process-wide engine under every other caller.

use qcast_capi::device::*;
use qcast_capi::ops::*;
use qcast_capi::stream::*;
use qcast_capi::tensor::*;
use qcast_capi::QcastStatus;
use qcast_core::{DType, ScalingMode};
use qcast_runtime::global;

#[test]
fn test_shutdown_then_reuse() {
    let shape = [4usize, 32];
    let data: Vec<f32> = (0..128).map(|i| i as f32 / 16.0 - 4.0).collect();
    let (mut x, mut q) = (0, 0);
    unsafe {
        assert_eq!(qcast_tensor_create(shape.as_ptr(), 2, DType::F32.code(), 0, &mut x), QcastStatus::Ok);
        assert_eq!(
            qcast_tensor_create(shape.as_ptr(), 2, DType::Float8E4M3.code(), ScalingMode::Tensor.code(), &mut q),
            QcastStatus::Ok
        );
        assert_eq!(qcast_tensor_write(x, data.as_ptr(), data.len()), QcastStatus::Ok);
    }

    let inputs = [x];
    let outputs = [q];
    let st = unsafe { qcast_multi_tensor_quantize(inputs.as_ptr(), outputs.as_ptr(), 0, 1, qcast_stream_default()) };
    assert_eq!(st, QcastStatus::Ok);
    assert_eq!(qcast_stream_synchronize(qcast_stream_default()), QcastStatus::Ok);
    assert!(global::is_initialized());

    assert_eq!(qcast_shutdown(), QcastStatus::Ok);
    assert!(!global::is_initialized());
    // idempotent
    assert_eq!(qcast_shutdown(), QcastStatus::Ok);

    // tensor handles survive; the default stream now resolves to a new engine
    let st = unsafe { qcast_multi_tensor_quantize(inputs.as_ptr(), outputs.as_ptr(), 0, 1, qcast_stream_default()) };
    assert_eq!(st, QcastStatus::Ok);
    assert_eq!(qcast_stream_synchronize(qcast_stream_default()), QcastStatus::Ok);
    assert!(global::is_initialized());

    let mut amax = 0.0;
    assert_eq!(unsafe { qcast_tensor_amax(q, &mut amax) }, QcastStatus::Ok);
    assert_eq!(amax, 4.0);
    let mut pool = 0;
    assert_eq!(unsafe { qcast_num_compute_streams(&mut pool) }, QcastStatus::Ok);
    assert!(pool >= 1);

    assert_eq!(qcast_shutdown(), QcastStatus::Ok);
    qcast_tensor_destroy(x);
    qcast_tensor_destroy(q);
}
