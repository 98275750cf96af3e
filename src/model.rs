use crate::process::MixError;

/// Hybrid, two parents and the auxiliary populations, drawn from the
/// selected populations. The four roles never share a population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmixtureModel {
    selected: Vec<String>,
    hybrid: String,
    parent1: String,
    parent2: String,
    auxiliaries: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Hybrid,
    Parent1,
    Parent2,
}

impl AdmixtureModel {
    /// Default model: the first three selected populations are hybrid,
    /// parent 1 and parent 2, the rest are auxiliaries.
    pub fn from_selection(selected: &[String]) -> Result<Self, MixError> {
        if selected.len() < 3 {
            return Err(MixError::InsufficientData(format!(
                "an admixture model needs 3 populations, {} selected",
                selected.len()
            )));
        }
        let mut distinct = selected.to_vec();
        distinct.sort();
        distinct.dedup();
        if distinct.len() != selected.len() {
            return Err(MixError::Parse("selected populations contain duplicates".to_string()));
        }

        Ok(AdmixtureModel {
            selected: selected.to_vec(),
            hybrid: selected[0].clone(),
            parent1: selected[1].clone(),
            parent2: selected[2].clone(),
            auxiliaries: selected[3..].to_vec(),
        })
    }

    pub fn hybrid(&self) -> &str {
        &self.hybrid
    }

    pub fn parent1(&self) -> &str {
        &self.parent1
    }

    pub fn parent2(&self) -> &str {
        &self.parent2
    }

    pub fn auxiliaries(&self) -> &[String] {
        &self.auxiliaries
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn set_hybrid(&mut self, population: &str) -> Result<(), MixError> {
        self.assign(Role::Hybrid, population)
    }

    pub fn set_parent1(&mut self, population: &str) -> Result<(), MixError> {
        self.assign(Role::Parent1, population)
    }

    pub fn set_parent2(&mut self, population: &str) -> Result<(), MixError> {
        self.assign(Role::Parent2, population)
    }

    /// Replaces the auxiliary set, dropping any of the three main roles and
    /// anything not selected.
    pub fn set_auxiliaries<S: AsRef<str>>(&mut self, populations: &[S]) {
        let mut auxiliaries: Vec<String> = Vec::with_capacity(populations.len());
        for pop in populations.iter().map(|p| p.as_ref()) {
            if pop != self.hybrid
                && pop != self.parent1
                && pop != self.parent2
                && self.selected.iter().any(|s| s == pop)
                && !auxiliaries.iter().any(|a| a == pop)
            {
                auxiliaries.push(pop.to_string());
            }
        }
        self.auxiliaries = auxiliaries;
    }

    fn occupant(&self, role: Role) -> &str {
        match role {
            Role::Hybrid => &self.hybrid,
            Role::Parent1 => &self.parent1,
            Role::Parent2 => &self.parent2,
        }
    }

    fn slot(&mut self, role: Role) -> &mut String {
        match role {
            Role::Hybrid => &mut self.hybrid,
            Role::Parent1 => &mut self.parent1,
            Role::Parent2 => &mut self.parent2,
        }
    }

    /// Puts `population` in `role`. If it held another main role, the
    /// previous occupant of `role` moves there; if it was an auxiliary it
    /// leaves the auxiliary set.
    fn assign(&mut self, role: Role, population: &str) -> Result<(), MixError> {
        if !self.selected.iter().any(|s| s == population) {
            return Err(MixError::UnknownPopulation(population.to_string()));
        }

        let previous = self.occupant(role).to_string();
        if previous == population {
            return Ok(());
        }

        let holder = [Role::Hybrid, Role::Parent1, Role::Parent2]
            .into_iter()
            .filter(|&other| other != role)
            .find(|&other| self.occupant(other) == population);

        match holder {
            Some(other) => *self.slot(other) = previous,
            None => self.auxiliaries.retain(|a| a != population),
        }

        *self.slot(role) = population.to_string();
        Ok(())
    }
}
