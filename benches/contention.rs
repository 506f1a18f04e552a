use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use enrolld::clock::SystemClock;
use enrolld::engine::{EnrollOutcome, Engine};
use enrolld::model::{CourseSpec, Student};
use enrolld::store::{Ledger, MemoryAuditLog, RequesterStore};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn bench_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("enrolld_bench");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{}.wal", Ulid::new()))
}

fn engine_for(ledger: &Arc<Ledger>) -> Engine {
    Engine::new(
        ledger.clone(),
        ledger.clone(),
        Arc::new(MemoryAuditLog::new()),
        Arc::new(SystemClock),
    )
}

async fn seed_students(ledger: &Ledger, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("S{i:06}");
        let student = Student::new(&id, "Bench", format!("{id}@bench.local"), "x");
        ledger.insert(&student).await.unwrap();
        ids.push(id);
    }
    ids
}

/// One student per course, all courses roomy: measures the uncontended write path.
async fn phase1_sequential(ledger: Arc<Ledger>) {
    let engine = engine_for(&ledger);
    let n = 2000;
    let students = seed_students(&ledger, n).await;
    for i in 0..n {
        ledger
            .create_course(CourseSpec::new(format!("SEQ{i}"), "Sequential", 10))
            .await
            .unwrap();
    }

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for (i, student) in students.iter().enumerate() {
        let t = Instant::now();
        engine.enroll(student, &format!("SEQ{i}")).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} enrollments in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("enroll latency", &mut latencies);
}

/// Many students race for a handful of seats in one course.
async fn phase2_contention(ledger: Arc<Ledger>) {
    let engine = Arc::new(engine_for(&ledger));
    let capacity = 10;
    let n_students = 500;
    ledger
        .create_course(CourseSpec::new("HOT", "Oversubscribed", capacity))
        .await
        .unwrap();
    let students = seed_students(&ledger, n_students).await;

    let start = Instant::now();
    let mut handles = Vec::with_capacity(n_students);
    for student in students {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let outcome = engine.enroll(&student, "HOT").await;
            (outcome, t.elapsed())
        }));
    }

    let mut latencies = Vec::with_capacity(n_students);
    let (mut enrolled, mut waitlisted, mut failed) = (0, 0, 0);
    for h in handles {
        let (outcome, elapsed) = h.await.unwrap();
        latencies.push(elapsed);
        match outcome {
            Ok(EnrollOutcome::Enrolled) => enrolled += 1,
            Ok(EnrollOutcome::Waitlisted { .. }) => waitlisted += 1,
            Err(_) => failed += 1,
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_students} concurrent enrolls for {capacity} seats in {:.2}s: {enrolled} enrolled, {waitlisted} waitlisted, {failed} failed",
        elapsed.as_secs_f64()
    );
    assert_eq!(enrolled, capacity as usize, "seat count drifted under contention");
    print_latency("contended enroll latency", &mut latencies);
}

/// Occupants drop one by one while waiters are promoted into the freed seats.
async fn phase3_promotion_churn(ledger: Arc<Ledger>) {
    let engine = engine_for(&ledger);
    let capacity = 50;
    let n_students = 1000;
    ledger
        .create_course(CourseSpec::new("CHURN", "Churn", capacity))
        .await
        .unwrap();
    let students = seed_students(&ledger, n_students).await;
    for student in &students {
        engine.enroll(student, "CHURN").await.unwrap();
    }

    let mut latencies = Vec::with_capacity(n_students);
    let start = Instant::now();
    for student in &students {
        let t = Instant::now();
        engine.drop_course(student, "CHURN").await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_students} drops with promotion in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n_students as f64 / elapsed.as_secs_f64()
    );
    print_latency("drop latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== enrolld contention benchmark ===\n");

    for durable in [false, true] {
        let label = if durable { "wal" } else { "in-memory" };
        let open = || -> Arc<Ledger> {
            if durable {
                Arc::new(Ledger::open(&bench_wal_path()).unwrap())
            } else {
                Arc::new(Ledger::in_memory())
            }
        };

        println!("[{label}] phase 1: sequential enroll throughput");
        phase1_sequential(open()).await;

        println!("\n[{label}] phase 2: seat contention");
        phase2_contention(open()).await;

        println!("\n[{label}] phase 3: drop and promotion churn");
        phase3_promotion_churn(open()).await;
        println!();
    }

    println!("=== done ===");
}
