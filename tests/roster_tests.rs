use async_trait::async_trait;
use medcouncil::client_wrapper::{ClientWrapper, Message, Role};
use medcouncil::clients::common::RetryPolicy;
use medcouncil::roster::{
    active_referee_index, build_doctor_pool, build_referees, circular_groups, ClientFactory,
    Language, Provider, ProviderPool, Referee, RosterError,
};
use std::collections::HashSet;
use std::sync::Arc;

struct MockClient {
    name: String,
}

#[async_trait]
impl ClientWrapper for MockClient {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, _messages: &[Message]) -> Result<Message, Box<dyn std::error::Error>> {
        Ok(Message::new(Role::Assistant, "noted"))
    }
}

fn factory(name: &str) -> ClientFactory {
    let name = name.to_string();
    Arc::new(move || {
        Arc::new(MockClient {
            name: name.clone(),
        }) as Arc<dyn ClientWrapper>
    })
}

fn pool(providers: &[Provider]) -> ProviderPool {
    providers.iter().fold(ProviderPool::new(), |acc, provider| {
        acc.with_provider(*provider, factory(provider.as_str()))
    })
}

fn specialties(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_two_doctors_per_specialty_cycling_providers() {
    let pool = pool(&[Provider::Claude, Provider::Gpt, Provider::Gemini]);
    let doctors = build_doctor_pool(
        &specialties(&["Neurology", "Ophthalmology"]),
        &pool,
        Language::English,
    )
    .unwrap();

    assert_eq!(doctors.len(), 4);
    let providers: Vec<Provider> = doctors.iter().map(|d| d.provider).collect();
    assert_eq!(
        providers,
        vec![Provider::Claude, Provider::Gpt, Provider::Gemini, Provider::Claude]
    );
    assert_eq!(doctors[0].name, "Kim Ne1");
    assert_eq!(doctors[1].name, "Lee Ne2");
    assert_eq!(doctors[2].name, "Park Op1");
    assert_eq!(doctors[0].specialty, "Neurology");
    assert_eq!(doctors[0].years_experience, 7);
    assert_eq!(doctors[1].years_experience, 14);
    assert_eq!(doctors[0].personality_traits.len(), 3);
    assert_eq!(doctors[0].model_name(), Provider::Claude.as_str());

    let names: HashSet<&str> = doctors.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names.len(), doctors.len());
}

#[test]
fn test_korean_names_have_no_space() {
    let pool = pool(&[Provider::Claude]);
    let doctors = build_doctor_pool(&specialties(&["신경과"]), &pool, Language::Korean).unwrap();
    assert_eq!(doctors[0].name, "김신경1");
    assert_eq!(doctors[1].name, "이신경2");
    assert!(doctors[0].persona_prompt().contains("한국어"));
}

#[test]
fn test_doctor_pool_needs_providers_and_specialties() {
    assert_eq!(
        build_doctor_pool(&specialties(&["Neurology"]), &ProviderPool::new(), Language::English)
            .unwrap_err(),
        RosterError::NoProviders
    );
    assert_eq!(
        build_doctor_pool(&[], &pool(&[Provider::Gpt]), Language::English).unwrap_err(),
        RosterError::NoSpecialties
    );
}

#[test]
fn test_groups_avoid_sharing_a_provider() {
    let pool = pool(&[Provider::Claude, Provider::Gpt]);
    let doctors = build_doctor_pool(
        &specialties(&["Neurology", "Internal Medicine", "Ophthalmology"]),
        &pool,
        Language::English,
    )
    .unwrap();
    let groups = circular_groups(&doctors).unwrap();

    assert!(!groups.is_empty());
    for (a, b) in &groups {
        assert_ne!(doctors[*a].provider, doctors[*b].provider);
    }
    let pairs: HashSet<(usize, usize)> = groups.iter().map(|(a, b)| ((*a).min(*b), (*a).max(*b))).collect();
    assert_eq!(pairs.len(), groups.len());
}

#[test]
fn test_single_provider_groups_pair_neighbours() {
    let pool = pool(&[Provider::Grok]);
    let doctors = build_doctor_pool(
        &specialties(&["Neurology", "Internal Medicine"]),
        &pool,
        Language::English,
    )
    .unwrap();
    let groups = circular_groups(&doctors).unwrap();
    assert_eq!(groups, vec![(0, 1), (1, 2), (2, 3), (3, 0)]);
}

#[test]
fn test_groups_need_two_doctors() {
    let pool = pool(&[Provider::Grok]);
    let mut doctors = build_doctor_pool(&specialties(&["Neurology"]), &pool, Language::English).unwrap();
    doctors.truncate(1);
    assert_eq!(
        circular_groups(&doctors).unwrap_err(),
        RosterError::NotEnoughDoctors(1)
    );
}

#[test]
fn test_referees_use_first_two_providers() {
    let two = build_referees(
        &pool(&[Provider::Gemini, Provider::Grok]),
        Language::English,
        &RetryPolicy::no_retry(),
    )
    .unwrap();
    assert_eq!(two.len(), 2);
    assert_eq!(two[0].name, "Referee A");
    assert_eq!(two[0].provider, Provider::Gemini);
    assert_eq!(two[0].initialization_round, 0);
    assert_eq!(two[1].provider, Provider::Grok);
    assert_eq!(two[1].initialization_round, 2);

    let one = build_referees(&pool(&[Provider::Gpt]), Language::Korean, &RetryPolicy::no_retry()).unwrap();
    assert_eq!(one[0].provider, Provider::Gpt);
    assert_eq!(one[1].provider, Provider::Gpt);
    assert_eq!(one[1].name, "심판 B");
}

#[test]
fn test_staggered_reset_schedules() {
    let client: Arc<dyn ClientWrapper> = Arc::new(MockClient {
        name: "mock".to_string(),
    });
    let a = Referee::new("Referee A", Provider::Claude, client.clone(), 0, Language::English);
    let b = Referee::new("Referee B", Provider::Gpt, client, 2, Language::English);

    let resets_a: Vec<u32> = (0..=15).filter(|r| a.should_reset(*r, 5)).collect();
    let resets_b: Vec<u32> = (0..=15).filter(|r| b.should_reset(*r, 5)).collect();
    assert_eq!(resets_a, vec![5, 10, 15]);
    assert_eq!(resets_b, vec![2, 7, 12]);
}

#[tokio::test]
async fn test_referee_reset_clears_memory_only() {
    let client: Arc<dyn ClientWrapper> = Arc::new(MockClient {
        name: "mock".to_string(),
    });
    let mut referee = Referee::new("Referee A", Provider::Claude, client, 0, Language::English)
        .with_retry_policy(RetryPolicy::no_retry());

    referee.evaluate("Round 1 opinions".to_string()).await.unwrap();
    referee.evaluate("Round 2 opinions".to_string()).await.unwrap();
    assert_eq!(referee.memory_len(), 4);

    referee.reset();
    assert_eq!(referee.memory_len(), 0);
    assert_eq!(referee.resets(), 1);
    assert_eq!(referee.model_name(), "mock");
}

#[test]
fn test_active_referee_alternates() {
    let order: Vec<usize> = (1..=4).map(|round| active_referee_index(round, 2)).collect();
    assert_eq!(order, vec![1, 0, 1, 0]);
    assert_eq!(active_referee_index(7, 0), 0);
}

#[test]
fn test_language_codes() {
    assert_eq!(Language::from_code("ko"), Some(Language::Korean));
    assert_eq!(Language::from_code("xx"), None);
    assert_eq!(Language::default(), Language::English);
    assert_eq!(Language::Japanese.code(), "ja");
}
