use crate::{
    common_cpu::Config, Access, Arg, Args, BindingModel, Context, DeviceInfo, EncoderState,
    ErrorKind, HostFunction, ImageDesc, ImageDim, ImageFormat, ImageLayout, InteropHandle, Kernel,
    KernelEntry, MapFlags, MemoryFlags, Queue, Registry, Signature, Slot, Stage, WorkItem,
};
use digit_layout::types as ty;
use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

const RW: MemoryFlags = MemoryFlags::READ_WRITE.union(MemoryFlags::HOST_READ_WRITE);

/// 单设备上下文，设备使用指定的绑定模型。
fn context(binding: BindingModel) -> (Context, Queue) {
    let config = Config::default();
    let info = DeviceInfo {
        name: format!("{binding:?}"),
        binding,
        ..DeviceInfo::host(&config)
    };
    let ctx = Context::new(Registry::new([info]), config).unwrap();
    let queue = ctx.create_queue(ctx.default_device()).unwrap();
    (ctx, queue)
}

fn kernel(ctx: &Context, name: &str, function: HostFunction, signature: Signature) -> Kernel {
    let entry = KernelEntry::new(ctx.default_device(), name, function, signature).unwrap();
    Kernel::new(name, [entry]).unwrap()
}

fn double(ctx: &Context) -> Kernel {
    kernel(
        ctx,
        "double",
        HostFunction::new(|item, args| {
            let buf = args.buffer(0);
            let n = args.pod::<u32>(1) as usize;
            let i = item.linear_id();
            if i < n {
                unsafe { buf.write(i, buf.read::<f32>(i) * 2.) }
            }
        }),
        Signature::new([Slot::buffer(Access::ReadWrite), Slot::pod::<u32>()]),
    )
}

/// 内核在打开之前阻塞。
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn wait(&self) {
        let (lock, cond) = &*self.0;
        drop(cond.wait_while(lock.lock().unwrap(), |open| !*open).unwrap())
    }

    fn open(&self) {
        let (lock, cond) = &*self.0;
        *lock.lock().unwrap() = true;
        cond.notify_all()
    }
}

/// 打开闸门后才把缓冲中的每个 `f32` 翻倍。
fn gated_double(ctx: &Context, gate: &Gate) -> Kernel {
    let gate = gate.clone();
    kernel(
        ctx,
        "gated_double",
        HostFunction::new(move |item: &WorkItem, args: &Args| {
            gate.wait();
            let buf = args.buffer(0);
            let i = item.linear_id();
            unsafe { buf.write(i, buf.read::<f32>(i) * 2.) }
        }),
        Signature::new([Slot::buffer(Access::ReadWrite)]),
    )
}

const MODELS: [BindingModel; 4] = [
    BindingModel::ParamBlock,
    BindingModel::Staged,
    BindingModel::DescriptorTable {
        combined_rw_images: false,
    },
    BindingModel::DescriptorTable {
        combined_rw_images: true,
    },
];

#[test]
fn test_double_i32() {
    for model in MODELS {
        let (ctx, queue) = context(model);
        let buf = ctx.create_buffer_with_data(&queue, &[1i32, 2, 3, 4], RW).unwrap();
        let kernel = kernel(
            &ctx,
            "double_i32",
            HostFunction::new(|item, args| {
                let buf = args.buffer(0);
                let i = item.linear_id();
                unsafe { buf.write(i, buf.read::<i32>(i) * 2) }
            }),
            Signature::new([Slot::buffer(Access::ReadWrite)]),
        );
        let dispatch = kernel.dispatch(&queue, 4u32, 4u32, &[Arg::Buffer(&buf)]).unwrap();
        queue.finish().unwrap();
        assert_eq!(dispatch.state(), EncoderState::Completed);
        assert_eq!(buf.read_as::<i32>(&queue).unwrap(), [2, 4, 6, 8], "{model:?}");
    }
}

#[test]
fn test_missing_arg() {
    let (ctx, queue) = context(BindingModel::Staged);
    let a = ctx.create_buffer_with_data(&queue, &[1i32, 2, 3, 4], RW).unwrap();
    let b = ctx.create_buffer(&queue, 16, RW).unwrap();
    let kernel = kernel(
        &ctx,
        "axpy",
        HostFunction::new(|item, args| {
            let i = item.linear_id();
            let x = unsafe { args.buffer(0).read::<i32>(i) };
            unsafe { args.buffer(1).write(i, x * args.pod::<i32>(2)) }
        }),
        Signature::new([
            Slot::buffer(Access::Read),
            Slot::buffer(Access::Write),
            Slot::pod::<i32>(),
        ]),
    );
    let n = queue.submitted_commands();
    let e = queue
        .execute(&kernel, 4u32, 4u32, &[Arg::Buffer(&a), Arg::Buffer(&b)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(queue.submitted_commands(), n);

    let k = 3i32;
    queue
        .execute(&kernel, 4u32, 4u32, &[Arg::Buffer(&a), Arg::Buffer(&b), Arg::pod(&k)])
        .unwrap();
    queue.finish().unwrap();
    assert_eq!(b.read_as::<i32>(&queue).unwrap(), [3, 6, 9, 12]);
}

#[test]
fn test_round_trip() {
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer_with_data(&queue, &[1i32, 2, 3, 4], RW).unwrap();
    for (size, offset) in [(0, 0), (4, 0), (8, 4), (0, 12)] {
        let src = buf.read_as::<u8>(&queue).unwrap();
        buf.write(&queue, &src[offset..], size, offset).unwrap();
        assert_eq!(buf.read_as::<i32>(&queue).unwrap(), [1, 2, 3, 4]);
    }

    let map = buf.map(&queue, MapFlags::READ_WRITE, 0, 0).unwrap();
    buf.unmap(&queue, map).unwrap();
    assert_eq!(buf.read_as::<i32>(&queue).unwrap(), [1, 2, 3, 4]);
}

#[test]
fn test_double() {
    const N: u32 = 1000;
    for model in MODELS {
        let (ctx, queue) = context(model);
        let data = (0..N).map(|i| i as f32).collect::<Vec<_>>();
        let buf = ctx.create_buffer_with_data(&queue, &data, RW).unwrap();
        let kernel = double(&ctx);

        queue
            .execute(&kernel, N, 64u32, &[Arg::Buffer(&buf), Arg::pod(&N)])
            .unwrap();
        queue.finish().unwrap();

        let ans = buf.read_as::<f32>(&queue).unwrap();
        assert!(ans.iter().zip(&data).all(|(a, b)| *a == b * 2.), "{model:?}");
    }
}

#[test]
fn test_arg_count_mismatch() {
    const N: u32 = 16;
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();
    let kernel = double(&ctx);
    let n = queue.submitted_commands();

    let e = queue.execute(&kernel, N, 4u32, &[Arg::Buffer(&buf)]).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    let e = queue
        .execute(&kernel, N, 4u32, &[Arg::pod(&N), Arg::Buffer(&buf)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(queue.submitted_commands(), n);

    // 失败的分发不影响后续分发
    queue
        .execute(&kernel, N, 4u32, &[Arg::Buffer(&buf), Arg::pod(&N)])
        .unwrap();
    queue.finish().unwrap();
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), [2.; N as usize]);
}

#[test]
fn test_concurrent_binding() {
    use crate::{start_record, stop_record, BindStep};

    const N: u32 = 64;
    const ROUNDS: usize = 32;
    let (ctx, queue) = context(BindingModel::Staged);
    let kernel = double(&ctx);
    let bufs = [(); 2].map(|_| ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap());

    start_record();
    std::thread::scope(|s| {
        for buf in &bufs {
            let queue = queue.clone();
            let kernel = kernel.clone();
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    queue
                        .execute(&kernel, N, 8u32, &[Arg::Buffer(buf), Arg::pod(&N)])
                        .unwrap();
                }
            });
        }
    });
    stop_record();
    queue.finish().unwrap();

    let trace = kernel.take_trace();
    assert_eq!(trace.len(), 2 * ROUNDS * 4);
    // 每次分发的绑定是连续的一段
    for chunk in trace.chunks(4) {
        let steps = chunk.iter().map(|e| e.step).collect::<Vec<_>>();
        assert_eq!(steps, [BindStep::Begin, BindStep::Slot(0), BindStep::Slot(1), BindStep::End]);
        assert!(chunk.iter().all(|e| e.dispatch == chunk[0].dispatch));
    }
    let expected = [2f32.powi(ROUNDS as _); N as usize];
    for buf in &bufs {
        assert_eq!(buf.read_as::<f32>(&queue).unwrap(), expected);
    }
}

#[test]
fn test_staged_snapshot() {
    const N: u32 = 8;
    let (ctx, queue) = context(BindingModel::Staged);
    let kernel = kernel(
        &ctx,
        "fill",
        HostFunction::new(|item, args| unsafe {
            args.buffer(0).write(item.linear_id(), args.pod::<u32>(1))
        }),
        Signature::new([Slot::buffer(Access::Write), Slot::pod::<u32>()]),
    );
    let bufs = (0..4u32)
        .map(|_| ctx.create_buffer(&queue, N as usize * 4, RW).unwrap())
        .collect::<Vec<_>>();
    // 连续提交，暂存表在前一次执行之前就被改写
    for (i, buf) in bufs.iter().enumerate() {
        let value = i as u32 + 10;
        queue
            .execute(&kernel, N, N, &[Arg::Buffer(buf), Arg::pod(&value)])
            .unwrap();
    }
    queue.finish().unwrap();
    for (i, buf) in bufs.iter().enumerate() {
        assert_eq!(buf.read_as::<u32>(&queue).unwrap(), [i as u32 + 10; N as usize]);
    }
}

#[test]
fn test_constant_buffer_lifetime() {
    const N: u32 = 32;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: false,
    });
    let dev = ctx.default_device();
    let gate = Gate::default();
    let kernel = kernel(
        &ctx,
        "affine",
        HostFunction::new({
            let gate = gate.clone();
            move |item: &WorkItem, args: &Args| {
                gate.wait();
                let i = item.linear_id();
                let value = args.pod::<f32>(1) * i as f32 + args.pod::<u32>(2) as f32;
                unsafe { args.buffer(0).write(i, value) }
            }
        }),
        Signature::new([Slot::buffer(Access::Write), Slot::pod::<f32>(), Slot::pod::<u32>()]),
    );
    let buf = ctx.create_buffer(&queue, N as usize * 4, RW).unwrap();
    let baseline = ctx.memory_stats(dev);

    let dispatch = kernel
        .dispatch(&queue, N, 8u32, &[Arg::Buffer(&buf), Arg::pod(&0.5f32), Arg::pod(&3u32)])
        .unwrap();
    // 执行期间常量缓冲存活
    let align = queue.device_info().limits.uniform_alignment;
    let live = ctx.memory_stats(dev);
    assert_eq!(live.allocations, baseline.allocations + 1);
    assert_eq!(live.bytes, baseline.bytes + 2 * align);
    assert_eq!(dispatch.state(), EncoderState::Submitted);

    gate.open();
    dispatch.wait().unwrap();
    assert_eq!(dispatch.state(), EncoderState::Completed);
    assert_eq!(ctx.memory_stats(dev), baseline);

    let expected = (0..N).map(|i| 0.5 * i as f32 + 3.).collect::<Vec<_>>();
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), expected);
}

#[test]
fn test_specialization_reuse() {
    const N: u32 = 64;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: true,
    });
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();
    let kernel = double(&ctx);
    let entry = kernel.entry(ctx.default_device()).unwrap().clone();

    let args = [Arg::Buffer(&buf), Arg::pod(&N)];
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| queue.execute(&kernel, N, 16u32, &args).unwrap());
        }
    });
    queue.execute(&kernel, N, 8u32, &args).unwrap();
    queue.finish().unwrap();
    assert_eq!(entry.specializations(), 2);
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), [32.; N as usize]);

    // 超出设备限制的形状构建失败，不会缓存
    let e = queue.execute(&kernel, N, 2048u32, &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Build);
    assert_eq!(entry.specializations(), 2);
}

#[test]
fn test_local_size_limit() {
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer(&queue, 4, RW).unwrap();
    let kernel = double(&ctx);
    let n = 1u32;
    let args = [Arg::Buffer(&buf), Arg::pod(&n)];

    let e = queue.execute(&kernel, [4u32, 4], [64u32, 64], &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    let e = queue.execute(&kernel, [4u32, 4], 4u32, &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(queue.submitted_commands(), 0);
}

#[test]
fn test_resource_checks() {
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let (other, other_queue) = context(BindingModel::ParamBlock);
    let kernel = double(&ctx);
    let n = 1u32;

    let foreign = other.create_buffer(&other_queue, 4, RW).unwrap();
    let e = queue
        .execute(&kernel, 1u32, 1u32, &[Arg::Buffer(&foreign), Arg::pod(&n)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::DeviceMismatch);

    let read_only = ctx.create_buffer(&queue, 4, MemoryFlags::READ).unwrap();
    let e = queue
        .execute(&kernel, 1u32, 1u32, &[Arg::Buffer(&read_only), Arg::pod(&n)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);

    let wrong = 1u64;
    let buf = ctx.create_buffer(&queue, 4, RW).unwrap();
    let e = queue
        .execute(&kernel, 1u32, 1u32, &[Arg::Buffer(&buf), Arg::pod(&wrong)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(queue.submitted_commands(), 0);
}

fn increment(ctx: &Context) -> Kernel {
    kernel(
        ctx,
        "increment",
        HostFunction::new(|item, args| {
            let image = args.image(0);
            let coord = item.global_id;
            unsafe {
                let [r, ..] = image.read(coord, 0);
                image.write(coord, 0, [r + 1., 0., 0., 1.])
            }
        }),
        Signature::new([Slot::image(Access::ReadWrite)]),
    )
}

#[test]
fn test_rw_image() {
    for model in MODELS {
        let (ctx, queue) = context(model);
        let desc = ImageDesc::new(ImageDim::D2(4, 4), ImageFormat::new(1, ty::F32));
        let data = (0..16).map(|i| i as f32).collect::<Vec<_>>();
        let image = ctx.create_image_with_data(&queue, desc, &data, RW).unwrap();
        let kernel = increment(&ctx);

        for _ in 0..2 {
            queue
                .execute(&kernel, [4u32, 4], [2u32, 2], &[Arg::read_write(&image)])
                .unwrap();
        }
        queue.finish().unwrap();
        assert_eq!(image.layout(), ImageLayout::Storage);
        assert_eq!(image.transitions(), 1);
        let ans = image.read_as::<f32>(&queue).unwrap();
        assert!(ans.iter().zip(&data).all(|(a, b)| *a == b + 2.), "{model:?}");

        // 声明与绑定的访问方向不一致
        let e = queue
            .execute(&kernel, [4u32, 4], [2u32, 2], &[Arg::read(&image)])
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::Validation);
    }
}

#[test]
fn test_image_array() {
    const W: u32 = 8;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: false,
    });
    let desc = ImageDesc::new(ImageDim::D1(W), ImageFormat::new(4, ty::U8));
    let images = [0u8, 51]
        .map(|v| ctx.create_image_with_data(&queue, desc, &[v; 4 * W as usize], RW).unwrap());
    let out = ctx.create_buffer(&queue, W as usize * 4, RW).unwrap();
    let kernel = kernel(
        &ctx,
        "sum",
        HostFunction::new(|item, args| {
            let sum = args
                .images(0)
                .iter()
                .map(|image| unsafe { image.read(item.global_id, 0)[0] })
                .sum::<f32>();
            unsafe { args.buffer(1).write(item.linear_id(), sum) }
        }),
        Signature::new([Slot::image_array(2, Access::Read), Slot::buffer(Access::Write)]),
    );

    queue
        .execute(
            &kernel,
            W,
            4u32,
            &[Arg::ImageArray(&images, Access::Read), Arg::Buffer(&out)],
        )
        .unwrap();
    queue.finish().unwrap();
    assert_eq!(out.read_as::<f32>(&queue).unwrap(), [0.2; W as usize]);
    for image in &images {
        assert_eq!(image.layout(), ImageLayout::Sampled);
        assert_eq!(image.transitions(), 1);
    }

    let e = queue
        .execute(
            &kernel,
            W,
            4u32,
            &[Arg::ImageArray(&images[..1], Access::Read), Arg::Buffer(&out)],
        )
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
}

#[test]
fn test_multi_stage() {
    const N: u32 = 100;
    for model in MODELS {
        let (ctx, queue) = context(model);
        let dev = ctx.default_device();
        let entry = KernelEntry::composed(
            dev,
            "scale-then-offset",
            [
                Stage::new(
                    HostFunction::new(|item, args| {
                        let i = item.linear_id();
                        let x = unsafe { args.buffer(0).read::<f32>(i) };
                        unsafe { args.stage_output(0).write(i, x * args.pod::<f32>(1)) }
                    }),
                    Signature::new([Slot::buffer(Access::Read), Slot::pod::<f32>()]),
                ),
                Stage::new(
                    HostFunction::new(|item, args| {
                        let i = item.linear_id();
                        let x = unsafe { args.stage_input(0).read::<f32>(i) };
                        unsafe { args.buffer(1).write(i, x + args.pod::<f32>(2)) }
                    }),
                    Signature::new([
                        Slot::stage_input(size_of::<f32>()),
                        Slot::buffer(Access::Write),
                        Slot::pod::<f32>(),
                    ]),
                ),
            ],
        )
        .unwrap();
        let kernel = Kernel::new("scale-then-offset", [entry]).unwrap();
        let data = (0..N).map(|i| i as f32).collect::<Vec<_>>();
        let src = ctx.create_buffer_with_data(&queue, &data, RW).unwrap();
        let dst = ctx.create_buffer(&queue, N as usize * 4, RW).unwrap();
        let baseline = ctx.memory_stats(dev);

        // 阶段输入槽不消耗参数
        queue
            .execute(
                &kernel,
                N,
                16u32,
                &[Arg::Buffer(&src), Arg::pod(&3f32), Arg::Buffer(&dst), Arg::pod(&1f32)],
            )
            .unwrap();
        queue.finish().unwrap();
        assert_eq!(ctx.memory_stats(dev), baseline);

        let ans = dst.read_as::<f32>(&queue).unwrap();
        assert!(ans.iter().zip(&data).all(|(a, b)| *a == b * 3. + 1.), "{model:?}");
    }
}

#[test]
fn test_device_fault() {
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer(&queue, 16, RW).unwrap();
    let boom = kernel(
        &ctx,
        "boom",
        HostFunction::new(|item, _| {
            if item.linear_id() == 3 {
                panic!("illegal address")
            }
        }),
        Signature::default(),
    );

    let dispatch = boom.dispatch(&queue, 4u32, 4u32, &[]).unwrap();
    assert!(dispatch.wait().unwrap_err().kind == ErrorKind::Submission);
    assert_eq!(dispatch.state(), EncoderState::Failed);
    assert_eq!(queue.finish().unwrap_err().kind, ErrorKind::Submission);
    assert!(queue.is_faulted());

    let n = 1u32;
    let e = queue
        .execute(&double(&ctx), 1u32, 1u32, &[Arg::Buffer(&buf), Arg::pod(&n)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Submission);
    assert_eq!(buf.write(&queue, &[0; 4], 0, 0).unwrap_err().kind, ErrorKind::Submission);

    // 其他队列不受影响
    let fresh = ctx.create_queue(ctx.default_device()).unwrap();
    fresh
        .execute(&double(&ctx), 1u32, 1u32, &[Arg::Buffer(&buf), Arg::pod(&n)])
        .unwrap();
    fresh.finish().unwrap();
}

#[test]
fn test_cooperative() {
    const N: u32 = 8;
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer_with_data(&queue, &[3f32; N as usize], RW).unwrap();
    let kernel = double(&ctx);
    let args = [Arg::Buffer(&buf), Arg::pod(&N)];
    queue.execute_cooperative(&kernel, N, 4u32, &args).unwrap();
    queue.flush().unwrap();
    queue.finish().unwrap();
    assert_eq!(queue.pending(), 0);
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), [6.; N as usize]);

    let mut info = DeviceInfo::host(&Config::default());
    info.features.cooperative = false;
    let ctx = Context::new(Registry::new([info]), Config::default()).unwrap();
    let queue = ctx.create_queue(ctx.default_device()).unwrap();
    let buf = ctx.create_buffer(&queue, 4, RW).unwrap();
    let kernel = double(&ctx);
    let e = queue
        .execute_cooperative(&kernel, 1u32, 1u32, &[Arg::Buffer(&buf), Arg::pod(&N)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
}

#[test]
fn test_buffer_args_keep_storage() {
    const N: u32 = 16;
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let dev = ctx.default_device();
    let gate = Gate::default();
    let kernel = gated_double(&ctx, &gate);
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();
    let live = ctx.memory_stats(dev);
    assert_eq!(live.allocations, 1);

    queue.execute(&kernel, N, 4u32, &[Arg::Buffer(&buf)]).unwrap();
    // 调用方释放全部句柄后，正在执行的分发仍持有存储
    drop(buf);
    assert_eq!(ctx.memory_stats(dev), live);
    assert_eq!(queue.pending(), 1);

    gate.open();
    queue.finish().unwrap();
    assert_eq!(ctx.memory_stats(dev).allocations, 0);
}

#[test]
fn test_blocking_map() {
    const N: u32 = 8;
    let (ctx, queue) = context(BindingModel::Staged);
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();

    // 默认的映射等待同一队列上已提交的写入
    let gate = Gate::default();
    let kernel = gated_double(&ctx, &gate);
    queue.execute(&kernel, N, 4u32, &[Arg::Buffer(&buf)]).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            gate.open()
        });
        let map = buf.map(&queue, MapFlags::READ, 0, 0).unwrap();
        assert_eq!(queue.pending(), 0);
        assert_eq!(map.as_slice_of::<f32>().unwrap(), [2.; N as usize]);
    });

    // 非阻塞映射在同步之后才能访问
    let gate = Gate::default();
    let kernel = gated_double(&ctx, &gate);
    queue.execute(&kernel, N, 4u32, &[Arg::Buffer(&buf)]).unwrap();
    let pending = buf.map_pending(&queue, MapFlags::READ, 0, 0).unwrap();
    assert_eq!(queue.pending(), 1);
    gate.open();
    let map = pending.synchronize(&queue).unwrap();
    assert_eq!(map.as_slice_of::<f32>().unwrap(), [4.; N as usize]);
}

#[test]
fn test_map_while_device_busy() {
    const N: u32 = 8;
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let other = ctx.create_queue(ctx.default_device()).unwrap();
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();
    let gate = Gate::default();
    let kernel = gated_double(&ctx, &gate);

    // 另一个队列上的分发正在写入
    other.execute(&kernel, N, 4u32, &[Arg::Buffer(&buf)]).unwrap();
    let e = buf.map(&queue, MapFlags::READ, 0, 0).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Synchronization);
    let e = buf
        .map_pending(&queue, MapFlags::READ, 0, 0)
        .unwrap()
        .synchronize(&queue)
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Synchronization);

    gate.open();
    other.finish().unwrap();
    let map = buf.map(&queue, MapFlags::READ, 0, 0).unwrap();
    assert_eq!(map.as_slice_of::<f32>().unwrap(), [2.; N as usize]);
}

#[test]
fn test_dispatch_mapped_resource() {
    const N: u32 = 4;
    let (ctx, queue) = context(BindingModel::ParamBlock);
    let buf = ctx.create_buffer_with_data(&queue, &[1f32; N as usize], RW).unwrap();
    let kernel = double(&ctx);
    let args = [Arg::Buffer(&buf), Arg::pod(&N)];
    let n = queue.submitted_commands();

    let map = buf.map(&queue, MapFlags::WRITE, 4, 0).unwrap();
    let e = queue.execute(&kernel, N, 4u32, &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Synchronization);
    drop(map);

    // 设备写入与主机读映射同样冲突
    let map = buf.map(&queue, MapFlags::READ, 0, 0).unwrap();
    let e = queue.execute(&kernel, N, 4u32, &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Synchronization);
    assert_eq!(queue.submitted_commands(), n);
    drop(map);

    queue.execute(&kernel, N, 4u32, &args).unwrap();
    queue.finish().unwrap();
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), [2.; N as usize]);
}

#[test]
fn test_dispatch_interop() {
    const N: u32 = 4;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: false,
    });
    let sync = |e: crate::Error| assert_eq!(e.kind, ErrorKind::Synchronization);

    let buf = ctx.wrap_buffer(&queue, InteropHandle(7), 16, RW).unwrap();
    let kernel = double(&ctx);
    let args = [Arg::Buffer(&buf), Arg::pod(&N)];
    sync(queue.execute(&kernel, N, 4u32, &args).unwrap_err());

    buf.acquire_interop(&queue).unwrap();
    buf.fill(&queue, &1f32.to_ne_bytes(), 0, 0).unwrap();
    queue.execute(&kernel, N, 4u32, &args).unwrap();
    assert_eq!(buf.read_as::<f32>(&queue).unwrap(), [2.; N as usize]);

    // 映射存活时不能交还，互操作资源不能改变大小
    let map = buf.map(&queue, MapFlags::READ, 0, 0).unwrap();
    sync(buf.release_interop(&queue).unwrap_err());
    drop(map);
    assert!(buf.resize(&queue, 32, true, false, None).unwrap_err().is_validation());
    buf.release_interop(&queue).unwrap();
    sync(queue.execute(&kernel, N, 4u32, &args).unwrap_err());

    let desc = ImageDesc::new(ImageDim::D2(4, 4), ImageFormat::new(1, ty::F32));
    let image = ctx.wrap_image(&queue, InteropHandle(8), desc, RW).unwrap();
    let kernel = increment(&ctx);
    let args = [Arg::read_write(&image)];
    sync(queue.execute(&kernel, [4u32, 4], [2u32, 2], &args).unwrap_err());
    assert_eq!(image.layout(), ImageLayout::Undefined);

    image.acquire_interop(&queue).unwrap();
    queue.execute(&kernel, [4u32, 4], [2u32, 2], &args).unwrap();
    image.release_interop(&queue).unwrap();
    assert_eq!(image.transitions(), 1);
    sync(queue.execute(&kernel, [4u32, 4], [2u32, 2], &args).unwrap_err());
    assert_eq!(queue.submitted_commands(), 4);
}

#[test]
fn test_rw_image_array() {
    const W: u32 = 4;
    for model in MODELS {
        let (ctx, queue) = context(model);
        let desc = ImageDesc::new(ImageDim::D1(W), ImageFormat::new(1, ty::F32));
        let images = [1f32, 10.]
            .map(|v| ctx.create_image_with_data(&queue, desc, &[v; W as usize], RW).unwrap());
        let kernel = kernel(
            &ctx,
            "accumulate",
            HostFunction::new(|item, args| {
                let [a, b] = args.images(0) else {
                    unreachable!()
                };
                let coord = item.global_id;
                unsafe {
                    let [x, ..] = a.read(coord, 0);
                    let [y, ..] = b.read(coord, 0);
                    b.write(coord, 0, [x + y, 0., 0., 1.])
                }
            }),
            Signature::new([Slot::image_array(2, Access::ReadWrite)]),
        );

        for _ in 0..2 {
            queue
                .execute(&kernel, W, 2u32, &[Arg::ImageArray(&images, Access::ReadWrite)])
                .unwrap();
        }
        queue.finish().unwrap();
        assert_eq!(images[1].read_as::<f32>(&queue).unwrap(), [12.; W as usize], "{model:?}");
        assert_eq!(images[0].read_as::<f32>(&queue).unwrap(), [1.; W as usize]);
        for image in &images {
            assert_eq!(image.layout(), ImageLayout::Storage);
            assert_eq!(image.transitions(), 1);
        }
    }
}

#[test]
fn test_failed_image_array() {
    const W: u32 = 4;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: false,
    });
    let desc = ImageDesc::new(ImageDim::D1(W), ImageFormat::new(1, ty::F32));
    let images = [
        ctx.create_image(&queue, desc, RW).unwrap(),
        // 第二个元素不可被设备写入
        ctx.create_image(&queue, desc, MemoryFlags::READ | MemoryFlags::HOST_READ_WRITE)
            .unwrap(),
    ];
    let kernel = kernel(
        &ctx,
        "clear",
        HostFunction::new(|item, args| {
            for image in args.images(0) {
                unsafe { image.write(item.global_id, 0, [0.; 4]) }
            }
        }),
        Signature::new([Slot::image_array(2, Access::Write)]),
    );

    let e = queue
        .execute(&kernel, W, 2u32, &[Arg::ImageArray(&images, Access::Write)])
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(queue.submitted_commands(), 0);
    for image in &images {
        assert_eq!(image.layout(), ImageLayout::Undefined);
        assert_eq!(image.transitions(), 0);
    }
    // 第一个元素没有残留的设备使用
    images[0].map(&queue, MapFlags::WRITE).unwrap();
}

#[test]
fn test_failed_submit_keeps_layout() {
    const W: u32 = 4;
    let (ctx, queue) = context(BindingModel::DescriptorTable {
        combined_rw_images: false,
    });
    let desc = ImageDesc::new(ImageDim::D2(W, W), ImageFormat::new(1, ty::F32));
    let image = ctx.create_image(&queue, desc, RW).unwrap();
    let out = ctx.create_buffer(&queue, (W * W) as usize * 4, RW).unwrap();
    let read = kernel(
        &ctx,
        "copy_out",
        HostFunction::new(|item, args| {
            let [r, ..] = unsafe { args.image(0).read(item.global_id, 0) };
            unsafe { args.buffer(1).write(item.linear_id(), r) }
        }),
        Signature::new([Slot::image(Access::Read), Slot::buffer(Access::Write)]),
    );
    let args = [Arg::read(&image), Arg::Buffer(&out)];

    queue
        .execute(&increment(&ctx), [W, W], [2u32, 2], &[Arg::read_write(&image)])
        .unwrap();
    queue.finish().unwrap();
    assert_eq!(image.layout(), ImageLayout::Storage);

    // 工作线程停止后提交失败，记录期的布局转换被撤销
    queue.shut_down();
    let e = queue.execute(&read, [W, W], [2u32, 2], &args).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Submission);
    assert_eq!(image.layout(), ImageLayout::Storage);
    assert_eq!(image.transitions(), 1);

    let fresh = ctx.create_queue(ctx.default_device()).unwrap();
    fresh.execute(&read, [W, W], [2u32, 2], &args).unwrap();
    fresh.finish().unwrap();
    assert_eq!(image.layout(), ImageLayout::Sampled);
    assert_eq!(image.transitions(), 2);
    assert_eq!(out.read_as::<f32>(&fresh).unwrap(), [1.; (W * W) as usize]);
}
