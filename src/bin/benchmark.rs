//! Performance benchmarks for a rustcache server
//!
//! Measures latency and throughput for concurrent callers sharing one
//! pooled client, which is the workload the batching scheduler is built for.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustcache::{Client, ClientConfig};

#[derive(Debug)]
struct BenchmarkResults {
    operation: String,
    total_operations: usize,
    duration: Duration,
    ops_per_second: f64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
}

impl BenchmarkResults {
    fn new(
        operation: String,
        total_operations: usize,
        duration: Duration,
        latencies: &mut [Duration],
    ) -> Self {
        latencies.sort();

        let ops_per_second = total_operations as f64 / duration.as_secs_f64();
        let avg_latency_ms = latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / latencies.len() as f64;

        let p95_index = (latencies.len() as f64 * 0.95) as usize;
        let p99_index = (latencies.len() as f64 * 0.99) as usize;

        let p95_latency_ms = latencies
            .get(p95_index)
            .unwrap_or(&Duration::ZERO)
            .as_secs_f64()
            * 1000.0;
        let p99_latency_ms = latencies
            .get(p99_index)
            .unwrap_or(&Duration::ZERO)
            .as_secs_f64()
            * 1000.0;

        Self {
            operation,
            total_operations,
            duration,
            ops_per_second,
            avg_latency_ms,
            p95_latency_ms,
            p99_latency_ms,
        }
    }

    fn print(&self) {
        println!("=== {} Benchmark Results ===", self.operation);
        println!("Total operations: {}", self.total_operations);
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Average latency: {:.2}ms", self.avg_latency_ms);
        println!("P95 latency: {:.2}ms", self.p95_latency_ms);
        println!("P99 latency: {:.2}ms", self.p99_latency_ms);
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClientConfig::default();
    if let Some(addr) = env::args().nth(1) {
        if let Some((host, port)) = addr.rsplit_once(':') {
            config.host = host.to_string();
            config.port = port.parse()?;
        }
    }

    println!("rustcache Performance Benchmarks");
    println!("================================");
    println!("Server: {}:{}", config.host, config.port);
    println!();

    let client = Arc::new(Client::connect(config).await?);

    run_sequential_benchmarks(&client).await?;
    run_concurrent_benchmarks(&client).await?;

    match Arc::try_unwrap(client) {
        Ok(mut client) => client.stop().await?,
        Err(_) => println!("warning: benchmark tasks still hold the client"),
    }

    Ok(())
}

async fn run_sequential_benchmarks(
    client: &Arc<Client>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Running sequential caller benchmarks...");

    benchmark_sets(client, 1, 5000).await?.print();
    benchmark_gets(client, 1, 5000).await?.print();

    Ok(())
}

async fn run_concurrent_benchmarks(
    client: &Arc<Client>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Running concurrent caller benchmarks...");

    for num_callers in [10, 50, 100] {
        benchmark_sets(client, num_callers, 1000).await?.print();
    }
    benchmark_mixed(client, 50, 1000).await?.print();

    Ok(())
}

async fn benchmark_sets(
    client: &Arc<Client>,
    num_callers: usize,
    ops_per_caller: usize,
) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut handles = Vec::with_capacity(num_callers);

    for caller_id in 0..num_callers {
        let client = Arc::clone(client);
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(ops_per_caller);
            for i in 0..ops_per_caller {
                let key = format!("bench_key_{}_{}", caller_id, i);
                let value = format!("bench_value_{}_{}", caller_id, i);

                let op_start = Instant::now();
                client.set(&key, &value).await.map_err(|e| e.to_string())?;
                latencies.push(op_start.elapsed());
            }
            Ok::<Vec<Duration>, String>(latencies)
        }));
    }

    let mut all_latencies = Vec::new();
    for handle in handles {
        all_latencies.extend(handle.await??);
    }

    Ok(BenchmarkResults::new(
        format!("SET ({} callers)", num_callers),
        num_callers * ops_per_caller,
        start.elapsed(),
        &mut all_latencies,
    ))
}

async fn benchmark_gets(
    client: &Arc<Client>,
    num_callers: usize,
    ops_per_caller: usize,
) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    // populate first so every get hits
    for i in 0..ops_per_caller {
        client
            .set(&format!("get_bench_key_{}", i), &format!("get_bench_value_{}", i))
            .await?;
    }

    let start = Instant::now();
    let mut handles = Vec::with_capacity(num_callers);

    for _ in 0..num_callers {
        let client = Arc::clone(client);
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(ops_per_caller);
            for i in 0..ops_per_caller {
                let key = format!("get_bench_key_{}", i);

                let op_start = Instant::now();
                client.get(&key).await.map_err(|e| e.to_string())?;
                latencies.push(op_start.elapsed());
            }
            Ok::<Vec<Duration>, String>(latencies)
        }));
    }

    let mut all_latencies = Vec::new();
    for handle in handles {
        all_latencies.extend(handle.await??);
    }

    Ok(BenchmarkResults::new(
        format!("GET ({} callers)", num_callers),
        num_callers * ops_per_caller,
        start.elapsed(),
        &mut all_latencies,
    ))
}

async fn benchmark_mixed(
    client: &Arc<Client>,
    num_callers: usize,
    ops_per_caller: usize,
) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut handles = Vec::with_capacity(num_callers);

    for caller_id in 0..num_callers {
        let client = Arc::clone(client);
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(ops_per_caller);
            for i in 0..ops_per_caller {
                // reuse a small key space so callers overlap and batches
                // actually deduplicate
                let key = format!("mixed_key_{}", i % 100);

                let op_start = Instant::now();
                let outcome = match i % 10 {
                    0..=6 => client.get(&key).await.map(|_| ()),
                    7..=8 => {
                        client
                            .set(&key, &format!("mixed_value_{}_{}", caller_id, i))
                            .await
                    }
                    _ => client.del(&key).await,
                };
                // misses are expected in a mixed workload
                let _ = outcome;
                latencies.push(op_start.elapsed());
            }
            Ok::<Vec<Duration>, String>(latencies)
        }));
    }

    let mut all_latencies = Vec::new();
    for handle in handles {
        all_latencies.extend(handle.await??);
    }

    Ok(BenchmarkResults::new(
        format!("Mixed Workload ({} callers)", num_callers),
        num_callers * ops_per_caller,
        start.elapsed(),
        &mut all_latencies,
    ))
}
