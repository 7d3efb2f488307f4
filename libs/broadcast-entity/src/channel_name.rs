//! Channel addressing. Names are a pure function of entity identifiers so
//! independent clients converge on the same managed channel without any
//! directory service.

pub fn interview_channel(interview_id: &str) -> String {
  format!("interview:{}", interview_id)
}

pub fn project_channel(project_id: &str) -> String {
  format!("project:{}", project_id)
}

pub fn company_presence_channel(company_id: &str) -> String {
  format!("company:{}:presence", company_id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_are_stable_for_the_same_ids() {
    assert_eq!(interview_channel("i1"), "interview:i1");
    assert_eq!(project_channel("p1"), "project:p1");
    assert_eq!(company_presence_channel("c1"), "company:c1:presence");
  }
}
