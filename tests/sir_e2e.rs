use stratamodel::{
    FlowRequest, Integrator, Model, ModelBuilder, ModelError, ModelResult, OdeSystem, Solution,
};

/// Fixed-step RK4 with a handful of sub-steps between output times.
struct Rk4 {
    substeps: usize,
}

impl Integrator for Rk4 {
    fn integrate(
        &self,
        system: &dyn OdeSystem,
        y0: &[f64],
        times: &[f64],
        equilibrium_stop: bool,
    ) -> ModelResult<Solution> {
        let n = system.ndim();
        let mut y = y0.to_vec();
        let mut out_times = vec![times[0]];
        let mut states = vec![y.clone()];
        let (mut k1, mut k2, mut k3, mut k4) = (vec![0.0; n], vec![0.0; n], vec![0.0; n], vec![0.0; n]);
        let mut tmp = vec![0.0; n];

        for window in times.windows(2) {
            let h = (window[1] - window[0]) / self.substeps as f64;
            let mut t = window[0];
            for _ in 0..self.substeps {
                system.rhs(t, &y, &mut k1)?;
                for i in 0..n {
                    tmp[i] = y[i] + 0.5 * h * k1[i];
                }
                system.rhs(t + 0.5 * h, &tmp, &mut k2)?;
                for i in 0..n {
                    tmp[i] = y[i] + 0.5 * h * k2[i];
                }
                system.rhs(t + 0.5 * h, &tmp, &mut k3)?;
                for i in 0..n {
                    tmp[i] = y[i] + h * k3[i];
                }
                system.rhs(t + h, &tmp, &mut k4)?;
                for i in 0..n {
                    y[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
                }
                t += h;
            }
            out_times.push(window[1]);
            states.push(y.clone());

            if equilibrium_stop {
                system.rhs(window[1], &y, &mut k1)?;
                if k1.iter().all(|d| d.abs() < 1e-9) {
                    break;
                }
            }
        }
        Ok(Solution::new(out_times, states))
    }
}

fn sir() -> ModelBuilder {
    ModelBuilder::new(["susceptible", "infectious", "recovered"])
        .times(vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0])
        .initial("susceptible", 999.0)
        .initial("infectious", 1.0)
        .parameter("beta", 0.4)
        .parameter("gamma", 0.1)
        .flow(FlowRequest::infection_frequency("beta", "susceptible", "infectious"))
        .flow(FlowRequest::standard("gamma", "infectious", "recovered"))
}

fn initial_derivative(model: &Model) -> Vec<f64> {
    let rhs = model.build_rhs().unwrap();
    let mut dydt = vec![0.0; rhs.ndim()];
    rhs.rhs(0.0, model.initial_values(), &mut dydt).unwrap();
    dydt
}

#[test]
fn sir_initial_derivatives() {
    let model = sir().build().unwrap();
    let dydt = initial_derivative(&model);

    let infection = 0.4 * 999.0 * (1.0 / 1000.0);
    assert!((dydt[0] + infection).abs() < 1e-12);
    assert!((dydt[1] - (infection - 0.1 * 1.0)).abs() < 1e-12);
    assert_eq!(dydt[2], 0.1);
    assert!(dydt.iter().sum::<f64>().abs() < 1e-12);
}

#[test]
fn sir_without_infectious_population_is_at_rest() {
    let model = sir().initial("infectious", 0.0).build().unwrap();
    let dydt = initial_derivative(&model);
    assert_eq!(dydt, vec![0.0, 0.0, 0.0]);
}

#[test]
fn sir_run_conserves_population_and_tracks_incidence() {
    let model = sir()
        .output("incidence", "susceptible", "infectious")
        .build()
        .unwrap();
    let outputs = model.run(&Rk4 { substeps: 50 }).unwrap();

    assert_eq!(outputs.solution.len(), 6);
    for state in &outputs.solution.states {
        assert!((state.iter().sum::<f64>() - 1000.0).abs() < 1e-6);
        assert!(state.iter().all(|v| *v >= -1e-9));
    }

    let susceptible = outputs.compartment_series("susceptible").unwrap();
    assert!(susceptible.windows(2).all(|w| w[1] <= w[0]));
    assert!(outputs.compartment_series("recovered").unwrap()[5] > 100.0);

    let incidence = &outputs.derived_outputs["incidence"];
    assert_eq!(incidence.len(), 6);
    assert!((incidence[0] - 0.4 * 999.0 / 1000.0).abs() < 1e-12);
}

#[test]
fn equilibrium_stop_ends_early() {
    let model = ModelBuilder::new(["susceptible", "infectious"])
        .times(vec![0.0, 1.0, 2.0, 3.0])
        .initial("susceptible", 10.0)
        .parameter("beta", 0.0)
        .flow(FlowRequest::infection_frequency("beta", "susceptible", "infectious"))
        .equilibrium_stop(true)
        .build()
        .unwrap();
    let outputs = model.run(&Rk4 { substeps: 1 }).unwrap();
    assert_eq!(outputs.solution.times, vec![0.0, 1.0]);
    assert_eq!(outputs.derived_outputs.len(), 0);
}

#[test]
fn unbound_time_function_is_fatal_to_the_run() {
    let model = sir().parameter("gamma", "recovery_curve").build().unwrap();

    // Assembly succeeds; the reference is only needed when evaluated.
    let rhs = model.build_rhs().unwrap();
    let mut dydt = vec![0.0; rhs.ndim()];
    let err = rhs.rhs(0.0, model.initial_values(), &mut dydt).unwrap_err();
    assert!(err.is_fatal_to_run());

    let err = model.run(&Rk4 { substeps: 1 }).unwrap_err();
    assert!(matches!(err, ModelError::Execution(_)));
}

#[test]
fn registered_time_function_is_used() {
    let mut model = sir().parameter("beta", "seasonal_beta").build().unwrap();
    model.register_function("seasonal_beta", |t| if t < 5.0 { 0.0 } else { 0.4 });

    let dydt = initial_derivative(&model);
    assert_eq!(dydt[0], 0.0);

    let rhs = model.build_rhs().unwrap();
    let mut later = vec![0.0; 3];
    rhs.rhs(6.0, model.initial_values(), &mut later).unwrap();
    assert!(later[0] < 0.0);
}
