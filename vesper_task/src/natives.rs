//! Script-callable surface over the reference engine. Every runtime
//! operation is exposed as a named native function taking and returning
//! engine values; runtime errors become script error values.

use std::sync::Arc;

use vesper_core::{CallError, Engine, LocalEngine, LocalHeap, RuntimeError, SharedArray, Value};

use crate::atomic;
use crate::barrier::Barrier;
use crate::channel::ChannelRef;
use crate::channel_set::{ChannelSet, SetReceive};
use crate::compute::ComputeError;
use crate::host::{Host, Object};
use crate::task::{self, Task};
use crate::wait::Wait;

type HostRef = Arc<Host<LocalEngine>>;

fn fail(err: RuntimeError) -> Value {
    Value::str(&err.to_string())
}

fn compute_fail(err: ComputeError<LocalEngine>) -> Value {
    match err {
        ComputeError::Script(value) => value,
        ComputeError::Runtime(err) => fail(err),
    }
}

fn arg<'a>(args: &'a [Value], index: usize) -> Result<&'a Value, Value> {
    args.get(index)
        .ok_or_else(|| Value::str(&format!("missing argument {}", index)))
}

fn handle_arg(args: &[Value], index: usize) -> Result<u64, Value> {
    arg(args, index)?
        .as_handle()
        .ok_or_else(|| Value::str("expected a handle"))
}

fn int_arg(args: &[Value], index: usize) -> Result<i32, Value> {
    arg(args, index)?
        .as_int()
        .ok_or_else(|| Value::str("expected an integer"))
}

fn index_arg(args: &[Value], index: usize) -> Result<usize, Value> {
    let value = int_arg(args, index)?;
    if value < 0 {
        return Err(Value::str("index cannot be negative"));
    }
    Ok(value as usize)
}

fn func_arg(args: &[Value], index: usize) -> Result<(String, String), Value> {
    match arg(args, index)? {
        Value::Func { unit, name } => Ok((unit.to_string(), name.to_string())),
        _ => Err(Value::str("expected a function reference")),
    }
}

fn shared_arg<'a>(args: &'a [Value], index: usize) -> Result<&'a Arc<SharedArray>, Value> {
    arg(args, index)?
        .as_shared()
        .ok_or_else(|| Value::str("expected a shared array"))
}

fn wait_arg(args: &[Value], index: usize) -> Result<Wait, Value> {
    match args.get(index) {
        Some(value) => Ok(Wait::from_raw(
            value.as_int().ok_or_else(|| Value::str("expected a timeout"))?,
        )),
        None => Ok(Wait::Forever),
    }
}

fn pack64(value: i64) -> Value {
    Value::array(vec![
        Value::Int(value as u32 as i32),
        Value::Int((value as u64 >> 32) as i32),
    ])
}

fn unpack64(lo: i32, hi: i32) -> i64 {
    (lo as u32 as u64 | ((hi as u32 as u64) << 32)) as i64
}

fn register<F>(host: &HostRef, name: &str, f: F)
where
    F: Fn(&HostRef, &LocalHeap, &[Value]) -> Result<Value, Value> + Send + Sync + 'static,
{
    let captured = Arc::clone(host);
    host.engine().register_native(
        name,
        LocalEngine::unit_fn(move |heap, args| f(&captured, heap, args)),
    );
}

/// Installs the whole native function set on the host's engine.
pub fn register_all(host: &HostRef) {
    register_task(host);
    register_channel(host);
    register_channel_set(host);
    register_barrier(host);
    register_compute(host);
    register_global(host);
    register_atomic(host);
}

fn register_task(host: &HostRef) {
    register(host, "task_create", |host, heap, args| {
        let (unit, entry) = func_arg(args, 0)?;
        let params = args.get(1).cloned().unwrap_or(Value::Null);
        let task =
            Task::create(host.config(), &unit, &entry, heap, &params).map_err(fail)?;
        let id = host.register(Object::Task(Arc::clone(&task)));
        task.set_tag(id);
        Ok(Value::Handle(id))
    });

    register(host, "task_get", |host, heap, _args| {
        match Task::current(&**host.engine(), heap) {
            Some(task) if task.tag() != 0 => Ok(Value::Handle(task.tag())),
            _ => Ok(Value::Null),
        }
    });

    register(host, "task_send", |host, heap, args| {
        if args.first().and_then(|v| v.as_handle()).is_some() {
            let task = host.task(handle_arg(args, 0)?).map_err(fail)?;
            let msg = arg(args, 1)?;
            let sent = task
                .send_request(heap, msg, wait_arg(args, 2)?)
                .map_err(fail)?;
            Ok(Value::Bool(sent))
        } else {
            let task = Task::current(&**host.engine(), heap)
                .ok_or_else(|| Value::str("not inside a task"))?;
            let msg = arg(args, 0)?;
            let sent = task
                .send_reply(heap, msg, wait_arg(args, 1)?)
                .map_err(fail)?;
            Ok(Value::Bool(sent))
        }
    });

    register(host, "task_receive", |host, heap, args| {
        let received = if args.first().and_then(|v| v.as_handle()).is_some() {
            let task = host.task(handle_arg(args, 0)?).map_err(fail)?;
            task.receive_reply(heap, Wait::Forever).map_err(fail)?
        } else {
            let task = Task::current(&**host.engine(), heap)
                .ok_or_else(|| Value::str("not inside a task"))?;
            task.receive_request(heap, Wait::Forever).map_err(fail)?
        };
        Ok(received.unwrap_or(Value::Null))
    });

    register(host, "task_receive_wait", |host, heap, args| {
        let received = if args.first().and_then(|v| v.as_handle()).is_some() {
            let task = host.task(handle_arg(args, 0)?).map_err(fail)?;
            let wait = Wait::from_raw(int_arg(args, 1)?);
            task.receive_reply(heap, wait).map_err(fail)?
        } else {
            let task = Task::current(&**host.engine(), heap)
                .ok_or_else(|| Value::str("not inside a task"))?;
            let wait = Wait::from_raw(int_arg(args, 0)?);
            task.receive_request(heap, wait).map_err(fail)?
        };
        Ok(received.unwrap_or(Value::Null))
    });

    register(host, "task_sleep", |_host, _heap, args| {
        task::sleep(int_arg(args, 0)?.max(0) as u32);
        Ok(Value::Null)
    });
}

fn register_channel(host: &HostRef) {
    register(host, "channel_create", |host, _heap, args| {
        let size = int_arg(args, 0)?;
        if size < 0 {
            return Err(Value::str("channel size cannot be negative"));
        }
        let channel =
            ChannelRef::create(Arc::clone(host.engine()), size as usize).map_err(fail)?;
        Ok(Value::Handle(host.register(Object::Channel(channel))))
    });

    register(host, "channel_send", |host, heap, args| {
        let channel = host.channel(handle_arg(args, 0)?).map_err(fail)?;
        let value = arg(args, 1)?;
        let sent = channel
            .send(heap, value, wait_arg(args, 2)?)
            .map_err(fail)?;
        Ok(Value::Bool(sent))
    });

    register(host, "channel_receive", |host, heap, args| {
        let channel = host.channel(handle_arg(args, 0)?).map_err(fail)?;
        let wait = wait_arg(args, 1)?;
        match channel.receive(heap, wait).map_err(fail)? {
            Some(value) => Ok(value),
            None => Ok(args.get(2).cloned().unwrap_or(Value::Null)),
        }
    });

    register(host, "channel_get_sender", |host, _heap, args| {
        let channel = host.channel(handle_arg(args, 0)?).map_err(fail)?;
        let sender = channel.sender().map_err(fail)?;
        Ok(Value::Handle(host.register(Object::Channel(sender))))
    });

    register(host, "channel_get_receiver", |host, _heap, args| {
        let channel = host.channel(handle_arg(args, 0)?).map_err(fail)?;
        let receiver = channel.receiver().map_err(fail)?;
        Ok(Value::Handle(host.register(Object::Channel(receiver))))
    });

    register(host, "channel_get_shared_count", |host, _heap, args| {
        let (strong, weak) = host
            .with_channel(handle_arg(args, 0)?, |ch| Ok(ch.shared_count()))
            .map_err(fail)?;
        Ok(Value::Int((strong + weak) as i32))
    });

    register(host, "channel_set_size", |host, _heap, args| {
        let size = int_arg(args, 1)?;
        if size < 1 {
            return Err(Value::str("queue capacity must be at least 1"));
        }
        host.with_channel(handle_arg(args, 0)?, |ch| ch.set_size(size as usize))
            .map_err(fail)?;
        Ok(Value::Null)
    });

    register(host, "channel_get_size", |host, _heap, args| {
        let size = host
            .with_channel(handle_arg(args, 0)?, |ch| Ok(ch.size()))
            .map_err(fail)?;
        Ok(Value::Int(size as i32))
    });

    register(host, "shared_array_create", |_host, _heap, args| {
        let len = int_arg(args, 0)?;
        if len < 0 {
            return Err(Value::str("length cannot be negative"));
        }
        Ok(Value::shared(len as usize))
    });
}

fn register_channel_set(host: &HostRef) {
    register(host, "channel_set_create", |host, _heap, _args| {
        Ok(Value::Handle(
            host.register(Object::ChannelSet(ChannelSet::new())),
        ))
    });

    register(host, "channel_set_add", |host, heap, args| {
        let set = host.channel_set(handle_arg(args, 0)?).map_err(fail)?;
        let channel = host.channel(handle_arg(args, 1)?).map_err(fail)?;
        let key = arg(args, 2)?;
        set.add(&channel, heap, key).map_err(fail)?;
        Ok(Value::Null)
    });

    register(host, "channel_set_remove", |host, _heap, args| {
        let set = host.channel_set(handle_arg(args, 0)?).map_err(fail)?;
        let channel = host.channel(handle_arg(args, 1)?).map_err(fail)?;
        set.remove(&channel).map_err(fail)?;
        Ok(Value::Null)
    });

    // channel_set_receive(set, error_key, timeout, timeout_key)
    // yields [key, value]; on a member error [error_key, message]; on
    // deadline expiry [timeout_key, null]
    register(host, "channel_set_receive", |host, heap, args| {
        let set = host.channel_set(handle_arg(args, 0)?).map_err(fail)?;
        let error_key = arg(args, 1)?.clone();
        let wait = Wait::from_raw(int_arg(args, 2)?);
        let timeout_key = arg(args, 3)?.clone();
        match set.receive(heap, wait).map_err(fail)? {
            SetReceive::Message { key, value } => Ok(Value::array(vec![key, value])),
            SetReceive::Error { error, .. } => {
                Ok(Value::array(vec![error_key, Value::str(&error.to_string())]))
            }
            SetReceive::TimedOut => Ok(Value::array(vec![timeout_key, Value::Null])),
        }
    });
}

fn register_barrier(host: &HostRef) {
    register(host, "barrier_create", |host, _heap, args| {
        let parties = int_arg(args, 0)?;
        if parties < 1 {
            return Err(Value::str("barrier needs at least one party"));
        }
        let barrier =
            Barrier::new(Arc::clone(host.engine()), parties as usize).map_err(fail)?;
        Ok(Value::Handle(host.register(Object::Barrier(barrier))))
    });

    register(host, "barrier_wait", |host, heap, args| {
        let barrier = host.barrier(handle_arg(args, 0)?).map_err(fail)?;
        barrier.wait(heap, args.get(1)).map_err(fail)?;
        Ok(Value::Null)
    });
}

fn register_compute(host: &HostRef) {
    register(host, "compute_task_run", |host, heap, args| {
        let pool = host.compute().map_err(fail)?;
        let process = arg(args, 0)?;
        let data = arg(args, 1)?;
        let finish = match (args.get(2), args.get(3)) {
            (Some(func), Some(data)) => Some((func.clone(), data.clone())),
            _ => None,
        };
        pool.run(heap, process, data, finish).map_err(compute_fail)?;
        Ok(Value::Null)
    });

    register(host, "compute_task_check_finished", |host, heap, _args| {
        let pool = host.compute().map_err(fail)?;
        pool.check_finished(heap).map_err(compute_fail)?;
        Ok(Value::Null)
    });

    register(host, "compute_task_finish_all", |host, heap, _args| {
        let pool = host.compute().map_err(fail)?;
        pool.finish_all(heap).map_err(compute_fail)?;
        Ok(Value::Null)
    });

    register(host, "compute_task_get_core_count", |host, _heap, _args| {
        let pool = host.compute().map_err(fail)?;
        Ok(Value::Int(pool.core_count() as i32))
    });

    register(host, "compute_task_run_parallel", |host, heap, args| {
        let pool = host.compute().map_err(fail)?;
        let (from, to, min_iters, process_index) = if args.len() >= 5 {
            (int_arg(args, 0)?, int_arg(args, 1)?, int_arg(args, 2)?, 3)
        } else {
            (int_arg(args, 0)?, int_arg(args, 1)?, 1, 2)
        };
        let process = arg(args, process_index)?;
        let data = arg(args, process_index + 1)?;
        pool.run_parallel(heap, from, to, min_iters, process, data)
            .map_err(compute_fail)?;
        Ok(Value::Null)
    });
}

fn register_global(host: &HostRef) {
    register(host, "global_set", |host, heap, args| {
        let key = arg(args, 0)?;
        let value = arg(args, 1)?;
        host.globals().set(heap, key, value).map_err(fail)?;
        Ok(Value::Null)
    });

    register(host, "global_get", |host, heap, args| {
        let key = arg(args, 0)?;
        let value = host
            .globals()
            .get(heap, key, host.config().resolve)
            .map_err(fail)?;
        Ok(value.unwrap_or(Value::Null))
    });

    register(host, "global_add", |host, heap, args| {
        let key = arg(args, 0)?;
        let amount = int_arg(args, 1)?;
        let prev = host.globals().add(heap, key, amount).map_err(fail)?;
        Ok(Value::Int(prev))
    });
}

fn register_atomic(host: &HostRef) {
    register(host, "atomic_get32", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        atomic::get32(arr, index).map(Value::Int).map_err(fail)
    });

    register(host, "atomic_set32", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        atomic::set32(arr, index, int_arg(args, 2)?).map_err(fail)?;
        Ok(Value::Null)
    });

    register(host, "atomic_add32", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        atomic::add32(arr, index, int_arg(args, 2)?)
            .map(Value::Int)
            .map_err(fail)
    });

    register(host, "atomic_cas32", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        atomic::cas32(arr, index, int_arg(args, 2)?, int_arg(args, 3)?)
            .map(Value::Int)
            .map_err(fail)
    });

    register(host, "atomic_get64", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        atomic::get64(arr, index).map(pack64).map_err(fail)
    });

    register(host, "atomic_set64", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        let value = unpack64(int_arg(args, 2)?, int_arg(args, 3)?);
        atomic::set64(arr, index, value).map_err(fail)?;
        Ok(Value::Null)
    });

    register(host, "atomic_add64", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        let amount = unpack64(int_arg(args, 2)?, int_arg(args, 3)?);
        atomic::add64(arr, index, amount).map(pack64).map_err(fail)
    });

    register(host, "atomic_cas64", |_host, _heap, args| {
        let arr = shared_arg(args, 0)?;
        let index = index_arg(args, 1)?;
        let expected = unpack64(int_arg(args, 2)?, int_arg(args, 3)?);
        let new = unpack64(int_arg(args, 4)?, int_arg(args, 5)?);
        atomic::cas64(arr, index, expected, new)
            .map(pack64)
            .map_err(fail)
    });

    // atomic_run(array_or_key, index?, func, data): runs func(data) while
    // holding the stripe mutex of the addressed element
    register(host, "atomic_run", |host, heap, args| {
        let engine = Arc::clone(host.engine());
        match args.first() {
            Some(Value::Shared(arr)) => {
                let index = index_arg(args, 1)?;
                let func = arg(args, 2)?.clone();
                let data = args.get(3).cloned().unwrap_or(Value::Null);
                let result = atomic::run(arr, index, || engine.call(heap, &func, &[data]))
                    .map_err(fail)?;
                match result {
                    Ok(value) => Ok(value),
                    Err(CallError::Script(err)) => Err(err),
                    Err(CallError::Engine(err)) => Err(fail(err)),
                }
            }
            Some(Value::Int(key)) => {
                let func = arg(args, 1)?.clone();
                let data = args.get(2).cloned().unwrap_or(Value::Null);
                let result =
                    atomic::run_keyed(*key as u32, || engine.call(heap, &func, &[data]));
                match result {
                    Ok(value) => Ok(value),
                    Err(CallError::Script(err)) => Err(err),
                    Err(CallError::Engine(err)) => Err(fail(err)),
                }
            }
            _ => Err(Value::str("expected a shared array or an integer key")),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use std::time::{Duration, Instant};

    fn new_host() -> (Arc<LocalEngine>, HostRef, LocalHeap) {
        let engine = LocalEngine::new();
        let host = Host::new(HeapConfig::new(Arc::clone(&engine)));
        register_all(&host);
        let heap = engine.create_heap().unwrap();
        (engine, host, heap)
    }

    fn call(engine: &LocalEngine, heap: &LocalHeap, name: &str, args: &[Value]) -> Value {
        engine
            .call_native(heap, name, args)
            .unwrap_or_else(|err| panic!("{} failed: {}", name, err))
    }

    #[test]
    fn channel_receive_returns_sentinel_after_deadline() {
        let (engine, _host, heap) = new_host();
        let ch = call(&engine, &heap, "channel_create", &[Value::Int(0)]);
        let started = Instant::now();
        let got = call(
            &engine,
            &heap,
            "channel_receive",
            &[ch, Value::Int(50), Value::str("sentinel")],
        );
        let elapsed = started.elapsed();
        assert_eq!(got, Value::str("sentinel"));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[test]
    fn buffered_channel_roundtrip_through_natives() {
        let (engine, _host, heap) = new_host();
        let ch = call(&engine, &heap, "channel_create", &[Value::Int(4)]);
        let sent = call(
            &engine,
            &heap,
            "channel_send",
            &[ch.clone(), Value::Int(11), Value::Int(0)],
        );
        assert_eq!(sent, Value::Bool(true));
        let got = call(&engine, &heap, "channel_receive", &[ch, Value::Int(0)]);
        assert_eq!(got, Value::Int(11));
    }

    #[test]
    fn task_round_trip_through_natives() {
        let (engine, _host, heap) = new_host();
        let native_engine = Arc::clone(&engine);
        engine.register_unit(
            "worker",
            vec![(
                "main",
                LocalEngine::unit_fn(move |heap, args| {
                    let n = args.first().and_then(|v| v.as_int()).unwrap_or(0);
                    native_engine.call_native(heap, "task_send", &[Value::Int(n + 1)])
                }),
            )],
        );
        let task = call(
            &engine,
            &heap,
            "task_create",
            &[Value::func("worker", "main"), Value::Int(42)],
        );
        let got = call(
            &engine,
            &heap,
            "task_receive_wait",
            &[task, Value::Int(5000)],
        );
        assert_eq!(got, Value::Int(43));
    }

    #[test]
    fn sender_view_cannot_receive() {
        let (engine, _host, heap) = new_host();
        let ch = call(&engine, &heap, "channel_create", &[Value::Int(1)]);
        let tx = call(&engine, &heap, "channel_get_sender", &[ch]);
        let err = engine
            .call_native(&heap, "channel_receive", &[tx, Value::Int(0)])
            .unwrap_err();
        assert!(matches!(err, Value::Str(_)));
    }

    #[test]
    fn global_counter_through_natives() {
        let (engine, _host, heap) = new_host();
        let key = Value::str("hits");
        assert_eq!(
            call(&engine, &heap, "global_add", &[key.clone(), Value::Int(2)]),
            Value::Int(0)
        );
        assert_eq!(
            call(&engine, &heap, "global_add", &[key.clone(), Value::Int(3)]),
            Value::Int(2)
        );
        assert_eq!(
            call(&engine, &heap, "global_get", &[key]),
            Value::Int(5)
        );
    }

    #[test]
    fn atomic_natives_operate_on_shared_arrays() {
        let (engine, _host, heap) = new_host();
        let arr = call(&engine, &heap, "shared_array_create", &[Value::Int(2)]);
        call(
            &engine,
            &heap,
            "atomic_set32",
            &[arr.clone(), Value::Int(0), Value::Int(10)],
        );
        assert_eq!(
            call(
                &engine,
                &heap,
                "atomic_add32",
                &[arr.clone(), Value::Int(0), Value::Int(5)]
            ),
            Value::Int(10)
        );
        assert_eq!(
            call(&engine, &heap, "atomic_get32", &[arr, Value::Int(0)]),
            Value::Int(15)
        );
    }

    #[test]
    fn negative_atomic_index_is_rejected() {
        let (engine, _host, heap) = new_host();
        let arr = call(&engine, &heap, "shared_array_create", &[Value::Int(1)]);
        call(
            &engine,
            &heap,
            "atomic_set32",
            &[arr.clone(), Value::Int(0), Value::Int(7)],
        );
        let err = engine
            .call_native(
                &heap,
                "atomic_set32",
                &[arr.clone(), Value::Int(-1), Value::Int(12345)],
            )
            .unwrap_err();
        assert!(matches!(err, Value::Str(_)));
        assert!(engine
            .call_native(&heap, "atomic_get64", &[arr.clone(), Value::Int(-2)])
            .is_err());
        // element 0 was untouched by the rejected write
        assert_eq!(
            call(&engine, &heap, "atomic_get32", &[arr, Value::Int(0)]),
            Value::Int(7)
        );
    }

    #[test]
    fn core_count_is_positive() {
        let (engine, _host, heap) = new_host();
        let count = call(&engine, &heap, "compute_task_get_core_count", &[]);
        assert!(count.as_int().unwrap_or(0) >= 1);
    }

    #[test]
    fn select_through_natives_reports_keys() {
        let (engine, _host, heap) = new_host();
        let a = call(&engine, &heap, "channel_create", &[Value::Int(2)]);
        let b = call(&engine, &heap, "channel_create", &[Value::Int(2)]);
        let set = call(&engine, &heap, "channel_set_create", &[]);
        call(
            &engine,
            &heap,
            "channel_set_add",
            &[set.clone(), a, Value::str("a")],
        );
        call(
            &engine,
            &heap,
            "channel_set_add",
            &[set.clone(), b.clone(), Value::str("b")],
        );
        call(
            &engine,
            &heap,
            "channel_send",
            &[b, Value::Int(3), Value::Int(0)],
        );
        let got = call(
            &engine,
            &heap,
            "channel_set_receive",
            &[set.clone(), Value::str("err"), Value::Int(1000), Value::str("timeout")],
        );
        assert_eq!(got, Value::array(vec![Value::str("b"), Value::Int(3)]));
        let got = call(
            &engine,
            &heap,
            "channel_set_receive",
            &[set, Value::str("err"), Value::Int(0), Value::str("timeout")],
        );
        assert_eq!(got, Value::array(vec![Value::str("timeout"), Value::Null]));
    }
}
